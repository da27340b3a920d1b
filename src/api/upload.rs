//! Upload validation
//!
//! Checks are lexical only: the extension decides, content is never sniffed.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::config::UploadConfig;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum UploadRejection {
    #[error("No file provided")]
    MissingFile,

    #[error("Empty filename")]
    EmptyFilename,

    #[error("File type not allowed. Allowed: {allowed}")]
    DisallowedExtension { allowed: String },

    /// `max_mb` is fractional, so small ceilings never read as "0 MB"
    #[error("File too large. Max size: {max_mb:?} MB")]
    TooLarge { max_mb: f64 },
}

/// Validates uploads against the allowed extensions and size ceiling
#[derive(Debug, Clone)]
pub struct UploadGuard {
    allowed_extensions: BTreeSet<String>,
    max_size: u64,
}

impl UploadGuard {
    pub fn new<I, S>(allowed_extensions: I, max_size: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed_extensions: allowed_extensions
                .into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            max_size,
        }
    }

    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(&config.allowed_extensions, config.max_file_size)
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn max_size_mb(&self) -> f64 {
        self.max_size as f64 / (1024.0 * 1024.0)
    }

    pub fn allowed_extensions(&self) -> impl Iterator<Item = &str> {
        self.allowed_extensions.iter().map(String::as_str)
    }

    /// Validate name and size; returns the lower-cased extension
    pub fn validate(&self, filename: &str, size: u64) -> Result<String, UploadRejection> {
        let extension = self.check_filename(filename)?;
        self.check_size(size)?;
        Ok(extension)
    }

    /// Name-only check, usable before the body has been read
    pub fn check_filename(&self, filename: &str) -> Result<String, UploadRejection> {
        if filename.is_empty() {
            return Err(UploadRejection::EmptyFilename);
        }

        let extension = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| self.allowed_extensions.contains(ext));

        extension.ok_or_else(|| UploadRejection::DisallowedExtension {
            allowed: self.allowed_list(),
        })
    }

    pub fn check_size(&self, size: u64) -> Result<(), UploadRejection> {
        if size > self.max_size {
            return Err(self.too_large());
        }
        Ok(())
    }

    pub fn too_large(&self) -> UploadRejection {
        UploadRejection::TooLarge {
            max_mb: self.max_size_mb(),
        }
    }

    fn allowed_list(&self) -> String {
        self.allowed_extensions().collect::<Vec<_>>().join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn guard() -> UploadGuard {
        UploadGuard::new(["mp3", "wav", "ogg", "m4a", "flac", "wma"], 100 * MIB)
    }

    #[test]
    fn test_accepts_allowed_extensions() {
        let guard = guard();
        assert_eq!(guard.validate("sample.wav", 2048), Ok("wav".to_string()));
        assert_eq!(guard.validate("Meeting.Recording.MP3", MIB), Ok("mp3".to_string()));
        assert_eq!(guard.validate("x.FlAc", 100 * MIB), Ok("flac".to_string()));
    }

    #[test]
    fn test_rejects_empty_name() {
        assert_eq!(guard().validate("", 10), Err(UploadRejection::EmptyFilename));
    }

    #[test]
    fn test_rejects_bad_extensions() {
        let guard = guard();
        for name in ["sample.txt", "noextension", "wav", "archive.wav.zip", "trailing."] {
            assert!(
                matches!(guard.validate(name, 10), Err(UploadRejection::DisallowedExtension { .. })),
                "{} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_rejects_oversized() {
        let err = guard().validate("big.wav", 100 * MIB + 1).unwrap_err();
        assert_eq!(err, UploadRejection::TooLarge { max_mb: 100.0 });
        assert_eq!(err.to_string(), "File too large. Max size: 100.0 MB");
    }

    #[test]
    fn test_fractional_ceiling_is_reported_exactly() {
        let half = UploadGuard::new(["wav"], 512 * 1024);
        let err = half.validate("a.wav", 512 * 1024 + 1).unwrap_err();
        assert_eq!(err.to_string(), "File too large. Max size: 0.5 MB");

        let odd = UploadGuard::new(["wav"], 3 * MIB / 2);
        assert_eq!(odd.too_large().to_string(), "File too large. Max size: 1.5 MB");
        assert_eq!(odd.max_size_mb(), 1.5);
    }

    #[test]
    fn test_extension_is_lexical_only() {
        // Not audio, but the name says it is
        assert!(guard().validate("notes.ogg", 3).is_ok());
    }

    #[test]
    fn test_message_lists_allowed_types() {
        let err = guard().validate("sample.txt", 1).unwrap_err();
        assert_eq!(err.to_string(), "File type not allowed. Allowed: flac, m4a, mp3, ogg, wav, wma");
    }

    #[test]
    fn test_config_extensions_normalised() {
        let guard = UploadGuard::new([".WAV"], MIB);
        assert!(guard.validate("a.wav", 1).is_ok());
    }
}
