//! Input validation utilities.
//!
//! Identifiers arrive from browsers through the relay, so they are checked
//! before they are used as routing keys.

/// Longest identifier accepted for a participant or room.
pub const MAX_ID_LEN: usize = 128;

/// Validate a participant or room identifier.
///
/// Identifiers must be non-empty, at most [`MAX_ID_LEN`] bytes, and free of
/// whitespace and control characters (they end up in pub/sub channel names).
pub fn validate_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("identifier cannot be empty".into());
    }
    if id.len() > MAX_ID_LEN {
        return Err(format!("identifier longer than {MAX_ID_LEN} bytes"));
    }
    if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err("identifier cannot contain whitespace or control characters".into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_uuid_like_ids() {
        assert!(validate_id("4f1c2b8e-9d1a-4c55-8a0e-3b1f7c9d2e10").is_ok());
        assert!(validate_id("room-1").is_ok());
    }

    #[test]
    fn rejects_empty_and_whitespace() {
        assert!(validate_id("").is_err());
        assert!(validate_id("user A").is_err());
        assert!(validate_id("tab\tid").is_err());
        assert!(validate_id(&"x".repeat(MAX_ID_LEN + 1)).is_err());
    }
}
