//! Message-level validation shared by the HTTP and WebSocket surfaces:
//! size limits, UTF-8 well-formedness, and terminal dimension bounds.
//!
//! Per-IP connection limiting and localhost-only enforcement, which this
//! codebase's own security module also carried, are dropped here — both
//! are deployment-topology concerns outside this crate's scope, not
//! something every embedding of it needs opinions about.

use crate::pty::{MAX_DIMENSION, MIN_DIMENSION};
use tracing::debug;

/// Validate a WebSocket message's size against a caller-supplied cap.
pub fn validate_message_size(data: &[u8], max_size: usize) -> Result<(), String> {
    if data.len() > max_size {
        debug!(
            message_size = data.len(),
            max_size = max_size,
            "Message size limit exceeded"
        );
        Err(format!(
            "Message size {} exceeds maximum allowed size {}",
            data.len(),
            max_size
        ))
    } else {
        Ok(())
    }
}

/// Validate terminal resize dimensions against `[MIN_DIMENSION, MAX_DIMENSION]`.
pub fn validate_terminal_dimensions(cols: u16, rows: u16) -> Result<(), String> {
    if !(MIN_DIMENSION..=MAX_DIMENSION).contains(&cols) {
        return Err(format!(
            "Invalid columns {}: must be between {} and {}",
            cols, MIN_DIMENSION, MAX_DIMENSION
        ));
    }
    if !(MIN_DIMENSION..=MAX_DIMENSION).contains(&rows) {
        return Err(format!(
            "Invalid rows {}: must be between {} and {}",
            rows, MIN_DIMENSION, MAX_DIMENSION
        ));
    }
    Ok(())
}

/// Validate that `data` is well-formed UTF-8.
pub fn validate_utf8(data: &[u8]) -> Result<(), String> {
    std::str::from_utf8(data).map(|_| ()).map_err(|e| {
        debug!("Invalid UTF-8 encoding: {}", e);
        "Invalid UTF-8 encoding".to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_message_size() {
        let small_data = vec![0u8; 100];
        assert!(validate_message_size(&small_data, 1024).is_ok());

        let large_data = vec![0u8; 2048];
        assert!(validate_message_size(&large_data, 1024).is_err());
    }

    #[test]
    fn test_validate_terminal_dimensions() {
        assert!(validate_terminal_dimensions(80, 24).is_ok());
        assert!(validate_terminal_dimensions(1, 1).is_ok());
        assert!(validate_terminal_dimensions(1000, 1000).is_ok());

        assert!(validate_terminal_dimensions(0, 24).is_err());
        assert!(validate_terminal_dimensions(80, 0).is_err());

        assert!(validate_terminal_dimensions(1001, 24).is_err());
        assert!(validate_terminal_dimensions(80, 1001).is_err());
    }

    #[test]
    fn test_validate_utf8() {
        let valid_utf8 = "Hello, world!".as_bytes();
        assert!(validate_utf8(valid_utf8).is_ok());

        let invalid_utf8 = vec![0xFF, 0xFE, 0xFD];
        assert!(validate_utf8(&invalid_utf8).is_err());
    }
}
