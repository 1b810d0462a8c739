//! Saved reference frequency: one floating-point value as plain text.

use std::fs;
use std::path::Path;

use super::{read_required_text, LoadError, SaveError};

/// Write a reference frequency (Hz).
pub fn write_reference(value: f64, path: &Path) -> Result<(), SaveError> {
    fs::write(path, value.to_string())?;
    Ok(())
}

/// Parse reference text; surrounding whitespace is ignored and only finite
/// values are accepted.
pub fn parse_reference(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Read a reference file written by [`write_reference`] or by hand.
pub fn read_reference(path: &Path) -> Result<f64, LoadError> {
    let text = read_required_text(path)?;
    parse_reference(&text).ok_or_else(|| {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        LoadError::InvalidReference(format!("Failed loading '{}' as reference.", name))
    })
}
