use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Deserializer};

use crate::error::ApiError;

static USERNAME_RE: OnceLock<Regex> = OnceLock::new();
static SLUG_RE: OnceLock<Regex> = OnceLock::new();

/// For PATCH-style payloads: wraps any present value (including an explicit
/// null) in `Some`, so `Option<Option<T>>` fields can tell "absent" apart
/// from "clear this field".
pub fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

/// Rejects null bytes, control characters (except whitespace controls) and
/// over-long values before they reach the store.
pub fn validate_input_string(input: &str, max_length: usize) -> Result<(), ApiError> {
    if input.contains('\0') {
        return Err(ApiError::InvalidInput("Input contains null bytes".into()));
    }

    for ch in input.chars() {
        if ch.is_control() && ch != '\n' && ch != '\r' && ch != '\t' {
            return Err(ApiError::InvalidInput(
                "Input contains invalid control characters".into(),
            ));
        }
    }

    if input.len() > max_length {
        return Err(ApiError::InvalidInput(format!(
            "Input exceeds maximum length of {} characters",
            max_length
        )));
    }

    Ok(())
}

pub fn validate_username(username: &str) -> Result<(), ApiError> {
    let username_regex = USERNAME_RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap());
    if !username_regex.is_match(username) || username.len() < 3 || username.len() > 50 {
        return Err(ApiError::InvalidInput(
            "Username must be 3-50 characters and contain only letters, numbers, underscores, and hyphens".into(),
        ));
    }
    Ok(())
}

/// Board slugs appear in URLs, so only unreserved URL characters pass.
pub fn validate_slug(slug: &str) -> Result<(), ApiError> {
    let slug_regex = SLUG_RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap());
    if !slug_regex.is_match(slug) || slug.len() > 100 {
        return Err(ApiError::InvalidInput(
            "Slug must be at most 100 characters and contain only letters, numbers, underscores, and hyphens".into(),
        ));
    }
    Ok(())
}

pub fn normalize_email(email: &str) -> Result<String, ApiError> {
    let email = email.trim().to_lowercase();
    validate_input_string(&email, 320)?;
    if !email.contains('@') || email.starts_with('@') || email.ends_with('@') {
        return Err(ApiError::InvalidInput("Invalid email address".into()));
    }
    Ok(email)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_null_bytes_and_control_chars() {
        assert!(validate_input_string("hello\0world", 100).is_err());
        assert!(validate_input_string("bad\x01char", 100).is_err());
        assert!(validate_input_string("fine text\nwith newline\t", 100).is_ok());
    }

    #[test]
    fn rejects_over_long_input() {
        let long = "a".repeat(101);
        assert!(validate_input_string(&long, 100).is_err());
        assert!(validate_input_string(&long, 101).is_ok());
    }

    #[test]
    fn username_rules() {
        assert!(validate_username("anna_01").is_ok());
        assert!(validate_username("ab").is_err());
        assert!(validate_username("has space").is_err());
        assert!(validate_username(&"x".repeat(51)).is_err());
    }

    #[test]
    fn slug_rules() {
        assert!(validate_slug("sprint-board_2").is_ok());
        assert!(validate_slug("has space").is_err());
        assert!(validate_slug("semi;colon").is_err());
        assert!(validate_slug("percent%20encoded").is_err());
        assert!(validate_slug("").is_err());
        assert!(validate_slug(&"x".repeat(101)).is_err());
    }

    #[test]
    fn email_is_lowercased_and_checked() {
        assert_eq!(normalize_email(" Anna@Example.COM ").unwrap(), "anna@example.com");
        assert!(normalize_email("no-at-sign").is_err());
        assert!(normalize_email("@leading").is_err());
    }
}
