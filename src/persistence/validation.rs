//! Checks applied to every name before it reaches a path or the engine.

use anyhow::{bail, Result};

pub const MAX_LABELER_NAME_LEN: usize = 64;
pub const MAX_VERSION_LEN: usize = 10;

/// Label files are keyed by recording name without its HDF5 extension.
pub fn strip_hdf5_extension(filename: &str) -> &str {
    filename
        .strip_suffix(".hdf5")
        .or_else(|| filename.strip_suffix(".h5"))
        .unwrap_or(filename)
}

pub fn validate_filename(filename: &str) -> Result<()> {
    if filename.trim().is_empty() {
        bail!("filename must not be empty");
    }
    if filename.contains('/') || filename.contains('\\') {
        bail!("filename '{filename}' must not contain path separators");
    }
    if filename.contains("..") {
        bail!("filename '{filename}' must not contain '..'");
    }
    if filename.chars().any(char::is_control) {
        bail!("filename contains control characters");
    }
    Ok(())
}

pub fn validate_labeler_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("labeler name must not be empty");
    }
    if name.len() > MAX_LABELER_NAME_LEN {
        bail!("labeler name is longer than {MAX_LABELER_NAME_LEN} characters");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        bail!("labeler name '{name}' may only contain letters, digits, '_' and '-'");
    }
    Ok(())
}

pub fn validate_version(version: &str) -> Result<()> {
    if version.is_empty() || version.chars().count() > MAX_VERSION_LEN {
        bail!("version must be 1 to {MAX_VERSION_LEN} characters");
    }
    Ok(())
}

pub fn validate_directory(label: &str, path: &str) -> Result<()> {
    if path.trim().is_empty() {
        bail!("{label} must not be empty");
    }
    if path.chars().any(char::is_control) {
        bail!("{label} contains control characters");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_only_hdf5_suffixes() {
        assert_eq!(strip_hdf5_extension("case_01.h5"), "case_01");
        assert_eq!(strip_hdf5_extension("case_01.hdf5"), "case_01");
        assert_eq!(strip_hdf5_extension("case_01.csv"), "case_01.csv");
        assert_eq!(strip_hdf5_extension("case"), "case");
    }

    #[test]
    fn rejects_traversal_and_separators() {
        assert!(validate_filename("patient.h5").is_ok());
        assert!(validate_filename("../etc/passwd").is_err());
        assert!(validate_filename("a/b.h5").is_err());
        assert!(validate_filename("a\\b.h5").is_err());
        assert!(validate_filename("  ").is_err());
    }

    #[test]
    fn labeler_names_are_restricted() {
        assert!(validate_labeler_name("labeler_1-b").is_ok());
        assert!(validate_labeler_name("").is_err());
        assert!(validate_labeler_name("bad name").is_err());
        assert!(validate_labeler_name(&"x".repeat(65)).is_err());
        assert!(validate_labeler_name(&"x".repeat(64)).is_ok());
    }

    #[test]
    fn version_length_is_bounded() {
        assert!(validate_version("1.0").is_ok());
        assert!(validate_version("").is_err());
        assert!(validate_version("1.0.0-beta.7").is_err());
    }
}
