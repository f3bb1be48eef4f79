//! Validation for script names and folder paths.
//!
//! Names are opaque identifiers but constrained to a safe alphabet so they
//! can double as file names and never carry SQL or shell metacharacters.

use thiserror::Error;

/// Maximum script name length in bytes.
pub const MAX_NAME_LEN: usize = 255;
/// Maximum folder path length in bytes.
pub const MAX_FOLDER_LEN: usize = 512;
/// Maximum folder nesting depth.
pub const MAX_FOLDER_DEPTH: usize = 10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NamingError {
    #[error("script name is empty")]
    EmptyName,
    #[error("script name exceeds {MAX_NAME_LEN} bytes")]
    NameTooLong,
    #[error("script name contains invalid character {0:?}")]
    InvalidNameChar(char),
    #[error("folder path exceeds {MAX_FOLDER_LEN} bytes")]
    FolderTooLong,
    #[error("folder path exceeds depth {MAX_FOLDER_DEPTH}")]
    FolderTooDeep,
    #[error("folder path has an empty segment")]
    EmptyFolderSegment,
    #[error("folder segment contains invalid character {0:?}")]
    InvalidFolderChar(char),
}

fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-'
}

/// Validate a script name: `[A-Za-z0-9_.-]{1,255}`.
pub fn validate_script_name(name: &str) -> Result<(), NamingError> {
    if name.is_empty() {
        return Err(NamingError::EmptyName);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(NamingError::NameTooLong);
    }
    if let Some(bad) = name.chars().find(|c| !is_safe_char(*c)) {
        return Err(NamingError::InvalidNameChar(bad));
    }
    Ok(())
}

/// Validate a folder path: `/`-joined segments of the name alphabet.
/// The empty string denotes the root folder and is valid.
pub fn validate_folder_path(folder: &str) -> Result<(), NamingError> {
    if folder.is_empty() {
        return Ok(());
    }
    if folder.len() > MAX_FOLDER_LEN {
        return Err(NamingError::FolderTooLong);
    }
    let segments: Vec<&str> = folder.split('/').collect();
    if segments.len() > MAX_FOLDER_DEPTH {
        return Err(NamingError::FolderTooDeep);
    }
    for segment in segments {
        if segment.is_empty() {
            return Err(NamingError::EmptyFolderSegment);
        }
        if let Some(bad) = segment.chars().find(|c| !is_safe_char(*c)) {
            return Err(NamingError::InvalidFolderChar(bad));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        for name in ["hello", "report_2024", "lib.utils", "my-script", "A1"] {
            assert!(validate_script_name(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn rejects_metacharacters() {
        for name in ["a b", "a;b", "a'b", "a/b", "a\\b", "ä", "x%"] {
            assert!(
                matches!(validate_script_name(name), Err(NamingError::InvalidNameChar(_))),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_empty_and_oversized_names() {
        assert_eq!(validate_script_name(""), Err(NamingError::EmptyName));
        let long = "a".repeat(MAX_NAME_LEN + 1);
        assert_eq!(validate_script_name(&long), Err(NamingError::NameTooLong));
        let exact = "a".repeat(MAX_NAME_LEN);
        assert!(validate_script_name(&exact).is_ok());
    }

    #[test]
    fn folder_rules() {
        assert!(validate_folder_path("").is_ok());
        assert!(validate_folder_path("reports/2024/q1").is_ok());
        assert_eq!(
            validate_folder_path("a//b"),
            Err(NamingError::EmptyFolderSegment)
        );
        assert_eq!(
            validate_folder_path("/leading"),
            Err(NamingError::EmptyFolderSegment)
        );
        let deep = vec!["d"; MAX_FOLDER_DEPTH + 1].join("/");
        assert_eq!(validate_folder_path(&deep), Err(NamingError::FolderTooDeep));
        assert!(matches!(
            validate_folder_path("ok/bad segment"),
            Err(NamingError::InvalidFolderChar(' '))
        ));
    }
}
