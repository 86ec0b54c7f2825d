//! Input validation for collection metadata and document keys.
//!
//! ## Character Whitelists
//!
//! - Collection names: `[A-Za-z][A-Za-z0-9_-]*`, 1-64 chars; a leading `_` is
//!   reserved for system collections.
//! - Document keys: `[a-zA-Z0-9_:.@()+,=;$!*'%-]`, 1-254 bytes.
//! - Shard keys: 1 to 8 attribute names; no system attributes except `_key`.

use std::fmt;

/// Maximum length of a collection name.
pub const MAX_COLLECTION_NAME_LENGTH: usize = 64;

/// Maximum byte length of a document key.
pub const MAX_DOCUMENT_KEY_LENGTH: usize = 254;

/// Maximum number of shard keys per collection.
pub const MAX_SHARD_KEYS: usize = 8;

/// Validation error with structured context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field that failed validation.
    pub field: String,
    /// Description of the violated constraint.
    pub constraint: String,
}

impl ValidationError {
    fn new(field: &str, constraint: impl Into<String>) -> Self {
        Self { field: field.to_string(), constraint: constraint.into() }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.constraint)
    }
}

impl std::error::Error for ValidationError {}

/// Validates a collection name.
///
/// Names must start with a letter (or `_` when `allow_system` is set),
/// continue with letters, digits, `_` or `-`, and not exceed
/// [`MAX_COLLECTION_NAME_LENGTH`] characters.
///
/// # Errors
///
/// Returns [`ValidationError`] naming the violated constraint.
pub fn validate_collection_name(name: &str, allow_system: bool) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::new("name", "must not be empty"));
    }
    if name.len() > MAX_COLLECTION_NAME_LENGTH {
        return Err(ValidationError::new(
            "name",
            format!("length {} exceeds maximum {}", name.len(), MAX_COLLECTION_NAME_LENGTH),
        ));
    }
    for (pos, c) in name.chars().enumerate() {
        let ok = if pos == 0 {
            c.is_ascii_alphabetic() || (allow_system && c == '_')
        } else {
            c.is_ascii_alphanumeric() || c == '_' || c == '-'
        };
        if !ok {
            return Err(ValidationError::new(
                "name",
                format!("invalid character {c:?} at position {pos}"),
            ));
        }
    }
    Ok(())
}

/// Validates a user-supplied document key.
///
/// # Errors
///
/// Returns [`ValidationError`] if the key is empty, too long, or contains a
/// character outside the whitelist.
pub fn validate_document_key(key: &str) -> Result<(), ValidationError> {
    if key.is_empty() {
        return Err(ValidationError::new("_key", "must not be empty"));
    }
    if key.len() > MAX_DOCUMENT_KEY_LENGTH {
        return Err(ValidationError::new(
            "_key",
            format!("length {} bytes exceeds maximum {}", key.len(), MAX_DOCUMENT_KEY_LENGTH),
        ));
    }
    if let Some(pos) = key.find(|c: char| !is_key_char(c)) {
        return Err(ValidationError::new(
            "_key",
            format!("invalid character at byte offset {pos}"),
        ));
    }
    Ok(())
}

/// Validates the shard-key list of a collection.
///
/// # Errors
///
/// Returns [`ValidationError`] if the list is empty, longer than
/// [`MAX_SHARD_KEYS`], or names a system attribute other than `_key`.
pub fn validate_shard_keys(shard_keys: &[String]) -> Result<(), ValidationError> {
    if shard_keys.is_empty() || shard_keys.len() > MAX_SHARD_KEYS {
        return Err(ValidationError::new(
            "shardKeys",
            format!("must contain 1 to {} keys, got {}", MAX_SHARD_KEYS, shard_keys.len()),
        ));
    }
    for key in shard_keys {
        if key.starts_with('_') && key != "_key" {
            return Err(ValidationError::new(
                "shardKeys",
                format!("system attribute {key:?} cannot be a shard key"),
            ));
        }
        if key.is_empty() {
            return Err(ValidationError::new("shardKeys", "empty attribute name"));
        }
    }
    Ok(())
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(c, '_' | ':' | '.' | '@' | '(' | ')' | '+' | ',' | '=' | ';' | '$' | '!' | '*'
            | '\'' | '%' | '-')
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_names_are_valid() {
        for name in ["users", "Orders2", "a", "with_underscore", "with-dash"] {
            validate_collection_name(name, false).expect(name);
        }
    }

    #[test]
    fn test_system_prefix_requires_allow_system() {
        assert!(validate_collection_name("_system", false).is_err());
        validate_collection_name("_system", true).unwrap();
    }

    #[test]
    fn test_rejects_leading_digit_and_specials() {
        assert!(validate_collection_name("1users", false).is_err());
        assert!(validate_collection_name("us ers", false).is_err());
        assert!(validate_collection_name("", false).is_err());
    }

    #[test]
    fn test_rejects_overlong_name() {
        let name = "a".repeat(MAX_COLLECTION_NAME_LENGTH + 1);
        assert!(validate_collection_name(&name, false).is_err());
        let name = "a".repeat(MAX_COLLECTION_NAME_LENGTH);
        validate_collection_name(&name, false).unwrap();
    }

    #[test]
    fn test_document_keys() {
        validate_document_key("abc123").unwrap();
        validate_document_key("user:alice@example").unwrap();
        assert!(validate_document_key("").is_err());
        assert!(validate_document_key("white space").is_err());
        assert!(validate_document_key(&"k".repeat(255)).is_err());
    }

    #[test]
    fn test_shard_keys() {
        validate_shard_keys(&["_key".to_string()]).unwrap();
        validate_shard_keys(&["country".to_string(), "city".to_string()]).unwrap();
        assert!(validate_shard_keys(&[]).is_err());
        assert!(validate_shard_keys(&vec!["k".to_string(); 9]).is_err());
        assert!(validate_shard_keys(&["_rev".to_string()]).is_err());
    }

    #[test]
    fn test_error_display() {
        let err = validate_collection_name("", false).unwrap_err();
        assert_eq!(err.to_string(), "name: must not be empty");
    }
}
