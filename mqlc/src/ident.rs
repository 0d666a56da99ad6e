//! Identifier safety checks.
//!
//! Every user-supplied name that ends up inside emitted SQL passes through
//! one of the two validators here first; nothing else is allowed to guard
//! name interpolation. Values never go through this path, they are bound
//! as parameters instead.

use std::sync::OnceLock;

use regex::Regex;

use crate::{Error, Reason, Result};

static FIELD_PATH: OnceLock<Regex> = OnceLock::new();
static IDENT: OnceLock<Regex> = OnceLock::new();

/// Check a dotted document field path.
///
/// Allowed characters: alphanumerics, `_`, `.` (segment separator), `-`,
/// and `$` for reserved names. Consecutive, leading or trailing dots are
/// rejected. Returns the input unchanged on success.
pub fn validate_field_path(path: &str) -> Result<&str> {
    let re = FIELD_PATH.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.$-]+$").unwrap());

    if re.is_match(path) && !path.contains("..") && !path.starts_with('.') && !path.ends_with('.') {
        Ok(path)
    } else {
        Err(Error::new(Reason::Validation {
            name: path.to_string(),
        }))
    }
}

/// Check a table or column identifier.
pub fn validate_identifier(name: &str) -> Result<&str> {
    let re = IDENT.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

    if re.is_match(name) {
        Ok(name)
    } else {
        Err(Error::new(Reason::Validation {
            name: name.to_string(),
        }))
    }
}

/// A validated dotted field path.
///
/// Constructing one is the only way to hand a field name to the SQL
/// generators, so holding a `FieldPath` is proof the name is safe to
/// interpolate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn parse(path: &str) -> Result<Self> {
        validate_field_path(path)?;
        Ok(FieldPath {
            segments: path.split('.').map(str::to_string).collect(),
        })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn dotted(&self) -> String {
        self.segments.join(".")
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.dotted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_paths() {
        assert!(validate_field_path("name").is_ok());
        assert!(validate_field_path("address.city").is_ok());
        assert!(validate_field_path("items.0.sku").is_ok());
        assert!(validate_field_path("$meta-field").is_ok());
    }

    #[test]
    fn rejects_unsafe_paths() {
        assert!(validate_field_path("").is_err());
        assert!(validate_field_path("a b").is_err());
        assert!(validate_field_path("a'b").is_err());
        assert!(validate_field_path("a..b").is_err());
        assert!(validate_field_path(".a").is_err());
        assert!(validate_field_path("a.").is_err());
        assert!(validate_field_path("a\0b").is_err());
        assert!(validate_field_path("foo'; DROP TABLE users;--").is_err());
    }

    #[test]
    fn rejects_unsafe_identifiers() {
        assert!(validate_identifier("users").is_ok());
        assert!(validate_identifier("_t2").is_ok());
        assert!(validate_identifier("2users").is_err());
        assert!(validate_identifier("users;--").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn field_path_splits_segments() {
        let path = FieldPath::parse("a.b.0").unwrap();
        assert_eq!(path.segments(), ["a", "b", "0"]);
        assert_eq!(path.dotted(), "a.b.0");
    }
}
