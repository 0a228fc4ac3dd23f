//! Validated SQL identifiers
//!
//! Table and column names cannot be bound as statement parameters, so any name
//! that ends up inside generated SQL goes through [`SqlIdentifier`] first.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DbError, DbResult};

/// Maximum identifier length accepted
pub const MAX_IDENTIFIER_LENGTH: usize = 64;

/// A table or column name safe to embed in SQL
///
/// # Examples
///
/// ```rust
/// use resilite_core::identifier::SqlIdentifier;
///
/// let table = SqlIdentifier::new("user_sessions").unwrap();
/// assert_eq!(table.quoted(), "\"user_sessions\"");
///
/// assert!(SqlIdentifier::new("users; DROP TABLE users").is_err());
/// assert!(SqlIdentifier::new("1users").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SqlIdentifier(String);

impl SqlIdentifier {
    pub fn new(name: impl Into<String>) -> DbResult<Self> {
        let name = name.into();
        let mut chars = name.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

        if !valid_start || !valid_rest || name.len() > MAX_IDENTIFIER_LENGTH {
            return Err(DbError::InvalidIdentifier(name));
        }
        if name.to_ascii_lowercase().starts_with("sqlite_") {
            return Err(DbError::InvalidIdentifier(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted form for use in SQL text
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for SqlIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SqlIdentifier {
    type Error = DbError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for SqlIdentifier {
    type Error = DbError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SqlIdentifier> for String {
    fn from(value: SqlIdentifier) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("users", true)]
    #[case("_private", true)]
    #[case("order_items2", true)]
    #[case("", false)]
    #[case("2fast", false)]
    #[case("users.name", false)]
    #[case("name\"--", false)]
    #[case("sqlite_master", false)]
    fn validates_names(#[case] name: &str, #[case] valid: bool) {
        assert_eq!(SqlIdentifier::new(name).is_ok(), valid);
    }

    #[test]
    fn rejects_overlong_names() {
        let name = "a".repeat(MAX_IDENTIFIER_LENGTH + 1);
        assert!(SqlIdentifier::new(name).is_err());
    }

    #[test]
    fn deserializes_with_validation() {
        let ok: SqlIdentifier = serde_json::from_str("\"notes\"").unwrap();
        assert_eq!(ok.as_str(), "notes");
        assert!(serde_json::from_str::<SqlIdentifier>("\"no tes\"").is_err());
    }
}
