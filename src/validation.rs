//! Input validation for sandbox specifications.
//!
//! Sandbox names end up in label selectors, resource names, and shell
//! commands, so they are restricted to DNS labels. Resource limits are
//! checked up front so a bad quantity never reaches the cluster.

use crate::error::{Error, Result};
use crate::spec::SandboxSpec;

/// Maximum length for sandbox names (DNS label limit).
const MAX_SANDBOX_NAME_LEN: usize = 63;

/// Resource keys whose values are validated; anything else is ignored.
const VALIDATED_RESOURCES: &[&str] = &["cpu", "memory", "ephemeral-storage"];

/// Validate a sandbox name as a DNS label: lowercase alphanumeric and
/// hyphens, 1-63 characters, alphanumeric at both ends.
pub fn validate_sandbox_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("Sandbox name cannot be empty".to_string()));
    }

    if name.len() > MAX_SANDBOX_NAME_LEN {
        return Err(Error::Validation(format!(
            "Sandbox name too long (max {} characters)",
            MAX_SANDBOX_NAME_LEN
        )));
    }

    let valid_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-';
    if !name.chars().all(valid_char) {
        return Err(Error::Validation(format!(
            "Sandbox name '{}' must contain only lowercase letters, digits, and hyphens",
            name
        )));
    }

    if name.starts_with('-') || name.ends_with('-') {
        return Err(Error::Validation(
            "Sandbox name must start and end with a letter or digit".to_string(),
        ));
    }

    Ok(())
}

/// Parse a resource quantity into its scaled integer value.
///
/// Accepts bare integers, the `m` milli suffix, and the binary suffixes
/// `Ki`, `Mi`, `Gi` (case-insensitive). Returns `None` for anything else.
pub fn parse_quantity(value: &str) -> Option<i64> {
    let value = value.trim().to_lowercase();
    if value.is_empty() {
        return None;
    }

    let (digits, multiplier) = if let Some(stripped) = value.strip_suffix("ki") {
        (stripped, 1024)
    } else if let Some(stripped) = value.strip_suffix("mi") {
        (stripped, 1024 * 1024)
    } else if let Some(stripped) = value.strip_suffix("gi") {
        (stripped, 1024 * 1024 * 1024)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped, 1)
    } else {
        (value.as_str(), 1)
    };

    let base: i64 = digits.parse().ok()?;
    base.checked_mul(multiplier)
}

/// Validate the resource limits of a spec. Values for `cpu`, `memory`, and
/// `ephemeral-storage` must parse to a positive quantity.
pub fn validate_limits(spec: &SandboxSpec) -> Result<()> {
    for (key, value) in &spec.limits {
        if !VALIDATED_RESOURCES.contains(&key.as_str()) {
            continue;
        }
        match parse_quantity(value) {
            Some(parsed) if parsed > 0 => {}
            _ => return Err(Error::Validation("Invalid resource limits".to_string())),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with_limits(limits: &[(&str, &str)]) -> SandboxSpec {
        let mut spec: SandboxSpec =
            serde_yaml::from_str("{name: a, image: alpine}").unwrap();
        spec.limits = limits
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        spec
    }

    #[test]
    fn test_valid_sandbox_names() {
        assert!(validate_sandbox_name("my-sandbox").is_ok());
        assert!(validate_sandbox_name("test123").is_ok());
        assert!(validate_sandbox_name("a").is_ok());
    }

    #[test]
    fn test_invalid_sandbox_names() {
        assert!(validate_sandbox_name("").is_err());
        assert!(validate_sandbox_name(&"a".repeat(64)).is_err());
        assert!(validate_sandbox_name("My-Sandbox").is_err());
        assert!(validate_sandbox_name("under_score").is_err());
        assert!(validate_sandbox_name("test;rm -rf /").is_err());
        assert!(validate_sandbox_name("-leading").is_err());
        assert!(validate_sandbox_name("trailing-").is_err());
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("2"), Some(2));
        assert_eq!(parse_quantity("500m"), Some(500));
        assert_eq!(parse_quantity("1Ki"), Some(1024));
        assert_eq!(parse_quantity("512Mi"), Some(512 * 1024 * 1024));
        assert_eq!(parse_quantity("2Gi"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_quantity(" 1gi "), Some(1024 * 1024 * 1024));
        assert_eq!(parse_quantity(""), None);
        assert_eq!(parse_quantity("abc"), None);
        assert_eq!(parse_quantity("1.5Gi"), None);
        assert_eq!(parse_quantity("Mi"), None);
    }

    #[test]
    fn test_validate_limits() {
        assert!(validate_limits(&spec_with_limits(&[("cpu", "500m"), ("memory", "1Gi")])).is_ok());
        assert!(validate_limits(&spec_with_limits(&[("cpu", "0")])).is_err());
        assert!(validate_limits(&spec_with_limits(&[("memory", "-1Gi")])).is_err());
        assert!(validate_limits(&spec_with_limits(&[("memory", "lots")])).is_err());
        // Unknown resource keys are ignored entirely.
        assert!(validate_limits(&spec_with_limits(&[("hugepages-2Mi", "bogus")])).is_ok());
        assert!(validate_limits(&spec_with_limits(&[])).is_ok());
    }
}
