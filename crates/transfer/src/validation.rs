use std::path::{Component, Path};

use crate::TransferError;

/// Size limit applied when the caller gives none.
pub const DEFAULT_MAX_FILE_SIZE_MB: u64 = 100;

/// Longest accepted file name, in bytes.
pub const MAX_FILENAME_LEN: usize = 255;

/// Pre-flight check of a file before it is queued for upload.
///
/// A `max_file_size_mb` of `None` or `Some(0)` falls back to
/// [`DEFAULT_MAX_FILE_SIZE_MB`].
pub fn validate_file(
    name: &str,
    size: u64,
    max_file_size_mb: Option<u64>,
) -> Result<(), TransferError> {
    let max_mb = match max_file_size_mb {
        Some(mb) if mb > 0 => mb,
        _ => DEFAULT_MAX_FILE_SIZE_MB,
    };
    if size > max_mb * 1024 * 1024 {
        return Err(TransferError::FileTooLarge { size, max_mb });
    }
    if size == 0 {
        return Err(TransferError::EmptyFile);
    }
    validate_name(name)
}

/// Validates a single path segment (file name or session id).
pub(crate) fn validate_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty() || name.len() > MAX_FILENAME_LEN {
        return Err(TransferError::InvalidName(format!(
            "name must be 1-{MAX_FILENAME_LEN} bytes"
        )));
    }
    if name == "." || name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(TransferError::InvalidName(format!(
            "name contains invalid characters: {name}"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(TransferError::InvalidName(
            "name contains control characters".into(),
        ));
    }
    Ok(())
}

/// Validates a target directory relative to the storage root.
///
/// Leading and trailing slashes are ignored; the empty path is the root.
pub fn validate_target_path(target_path: &str) -> Result<(), TransferError> {
    let trimmed = target_path.trim_matches('/');
    if trimmed.chars().any(char::is_control) {
        return Err(TransferError::InvalidPath(
            "path contains control characters".into(),
        ));
    }

    for component in Path::new(trimmed).components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {target_path}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {target_path}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn accepts_regular_file() {
        assert!(validate_file("report.pdf", 5 * MB, None).is_ok());
    }

    #[test]
    fn default_limit_is_100mb() {
        assert!(validate_file("big.iso", 100 * MB, None).is_ok());
        assert!(matches!(
            validate_file("big.iso", 100 * MB + 1, None),
            Err(TransferError::FileTooLarge { max_mb: 100, .. })
        ));
        assert!(validate_file("big.iso", 100 * MB + 1, Some(0)).is_err());
    }

    #[test]
    fn custom_limit() {
        assert!(validate_file("a.bin", 2 * MB, Some(1)).is_err());
        assert!(validate_file("a.bin", 200 * MB, Some(500)).is_ok());
    }

    #[test]
    fn rejects_empty_file() {
        assert!(matches!(
            validate_file("a.bin", 0, None),
            Err(TransferError::EmptyFile)
        ));
    }

    #[test]
    fn rejects_bad_names() {
        let long = "a".repeat(256);
        for name in ["", ".", "..", "a/b.txt", "a\\b.txt", "x..y", "tab\tname", long.as_str()] {
            assert!(
                matches!(validate_file(name, 10, None), Err(TransferError::InvalidName(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn accepts_max_length_and_unicode_names() {
        assert!(validate_file(&"a".repeat(255), 10, None).is_ok());
        assert!(validate_file("año 2024 résumé.docx", 10, None).is_ok());
        assert!(validate_file(".hidden", 10, None).is_ok());
    }

    #[test]
    fn target_paths() {
        assert!(validate_target_path("").is_ok());
        assert!(validate_target_path("/").is_ok());
        assert!(validate_target_path("/docs/2024/").is_ok());
        assert!(validate_target_path("./docs").is_ok());
        assert!(validate_target_path("../etc").is_err());
        assert!(validate_target_path("docs/../../etc").is_err());
        assert!(validate_target_path("docs\n").is_err());
    }
}
