//! # Validation
//!
//! Validates RootSync specs, Kubernetes names and duration strings.
//!
//! Every failure here is a configuration error: retrying without a spec
//! change cannot succeed.

use crate::crd::RootSyncSpec;
use anyhow::Result;
use regex::Regex;
use std::time::Duration;

/// Validate a Kubernetes name that must be an RFC 1123 label
/// Format: lowercase alphanumeric, hyphens
/// Length: 1-63 characters
/// Cannot start or end with hyphen
pub fn validate_dns1123_label(name: &str, field_name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(anyhow::anyhow!("{field_name} cannot be empty"));
    }

    if name.len() > 63 {
        return Err(anyhow::anyhow!(
            "{} '{}' exceeds maximum length of 63 characters (got {})",
            field_name,
            name,
            name.len()
        ));
    }

    // RFC 1123 label: [a-z0-9]([-a-z0-9]*[a-z0-9])?
    let label_regex = Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$")
        .map_err(|e| anyhow::anyhow!("Failed to compile regex: {e}"))?;

    if !label_regex.is_match(name) {
        return Err(anyhow::anyhow!(
            "{field_name} '{name}' must be a valid RFC 1123 label (lowercase alphanumeric, hyphens; cannot start/end with hyphen)"
        ));
    }

    Ok(())
}

/// Validate Kubernetes resource name (RFC 1123 subdomain)
/// Format: lowercase alphanumeric, hyphens, dots
/// Length: 1-253 characters
/// Cannot start or end with hyphen or dot
pub fn validate_kubernetes_name(name: &str, field_name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(anyhow::anyhow!("{field_name} cannot be empty"));
    }

    if name.len() > 253 {
        return Err(anyhow::anyhow!(
            "{} '{}' exceeds maximum length of 253 characters (got {})",
            field_name,
            name,
            name.len()
        ));
    }

    let name_regex =
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
            .map_err(|e| anyhow::anyhow!("Failed to compile regex: {e}"))?;

    if !name_regex.is_match(name) {
        return Err(anyhow::anyhow!(
            "{field_name} '{name}' must be a valid Kubernetes name (lowercase alphanumeric, hyphens, dots; cannot start/end with hyphen or dot)"
        ));
    }

    Ok(())
}

/// Validate a ClusterRole name
/// RBAC object names only exclude path separators, so `system:` style names are allowed
pub fn validate_cluster_role_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(anyhow::anyhow!("override.clusterRole cannot be empty"));
    }
    if name.contains('/') || name.contains('%') || name == "." || name == ".." {
        return Err(anyhow::anyhow!(
            "override.clusterRole '{name}' is not a valid ClusterRole name"
        ));
    }
    Ok(())
}

/// Parse a git-sync period into a Duration
/// Supports formats: "500ms", "15s", "1m", "1h"
pub fn parse_period(period: &str) -> Result<Duration> {
    let period_trimmed = period.trim();

    if period_trimmed.is_empty() {
        return Err(anyhow::anyhow!("git.period cannot be empty"));
    }

    let period_regex = Regex::new(r"^(?P<number>\d+)(?P<unit>ms|s|m|h)$")
        .map_err(|e| anyhow::anyhow!("Failed to compile regex: {e}"))?;

    let captures = period_regex
        .captures(period_trimmed)
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Invalid git.period '{period_trimmed}'. Expected format: <number><unit> (e.g., '15s', '1m')"
            )
        })?;

    let number: u64 = captures
        .name("number")
        .map(|m| m.as_str())
        .unwrap_or_default()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid git.period '{period_trimmed}': {e}"))?;

    if number == 0 {
        return Err(anyhow::anyhow!(
            "git.period must be greater than 0, got '{period_trimmed}'"
        ));
    }

    let duration = match captures.name("unit").map(|m| m.as_str()) {
        Some("ms") => Duration::from_millis(number),
        Some("s") => Duration::from_secs(number),
        Some("m") => Duration::from_secs(number.saturating_mul(60)),
        Some("h") => Duration::from_secs(number.saturating_mul(3600)),
        _ => {
            return Err(anyhow::anyhow!(
                "Invalid unit in git.period '{period_trimmed}'. Expected: ms, s, m or h"
            ));
        }
    };

    Ok(duration)
}

/// Validate the shape of a RootSync spec
///
/// Credentials are checked later, once the referenced Secret is resolved.
pub fn validate_root_sync_spec(spec: &RootSyncSpec) -> Result<()> {
    if spec.source_type != "git" {
        return Err(anyhow::anyhow!(
            "sourceType must be 'git', got '{}'",
            spec.source_type
        ));
    }

    match spec.source_format.as_str() {
        "unstructured" | "hierarchy" => {}
        other => {
            return Err(anyhow::anyhow!(
                "sourceFormat must be 'unstructured' or 'hierarchy', got '{other}'"
            ));
        }
    }

    let git = spec
        .git
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("git is required when sourceType is 'git'"))?;

    if git.repo.trim().is_empty() {
        return Err(anyhow::anyhow!("git.repo cannot be empty"));
    }
    if git.branch.trim().is_empty() {
        return Err(anyhow::anyhow!("git.branch cannot be empty"));
    }
    if git.dir.trim().is_empty() {
        return Err(anyhow::anyhow!("git.dir cannot be empty"));
    }
    parse_period(&git.period)?;

    if let Some(secret_ref) = &git.secret_ref {
        validate_kubernetes_name(&secret_ref.name, "git.secretRef.name")?;
    }

    if let Some(ov) = &spec.override_spec {
        if let Some(role) = &ov.cluster_role {
            validate_cluster_role_name(role)?;
        }
        if let Some(depth) = ov.git_sync_depth {
            if depth < 0 {
                return Err(anyhow::anyhow!(
                    "override.gitSyncDepth must not be negative, got {depth}"
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(value: serde_json::Value) -> RootSyncSpec {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_dns1123_label() {
        assert!(validate_dns1123_label("reconciler-rs1", "name").is_ok());
        assert!(validate_dns1123_label("Reconciler", "name").is_err());
        assert!(validate_dns1123_label("-rs1", "name").is_err());
        assert!(validate_dns1123_label("a.b", "name").is_err());
        assert!(validate_dns1123_label(&"a".repeat(64), "name").is_err());
        assert!(validate_dns1123_label(&"a".repeat(63), "name").is_ok());
    }

    #[test]
    fn test_kubernetes_name() {
        assert!(validate_kubernetes_name("git-creds", "secret").is_ok());
        assert!(validate_kubernetes_name("git.creds", "secret").is_ok());
        assert!(validate_kubernetes_name("Git_Creds", "secret").is_err());
        assert!(validate_kubernetes_name("", "secret").is_err());
    }

    #[test]
    fn test_parse_period() {
        assert_eq!(parse_period("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_period("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_period("500ms").unwrap(), Duration::from_millis(500));
        assert!(parse_period("0s").is_err());
        assert!(parse_period("fifteen").is_err());
        assert!(parse_period("").is_err());
    }

    #[test]
    fn test_valid_spec() {
        let s = spec(serde_json::json!({
            "git": { "repo": "https://example.com/r.git", "auth": "none" },
            "override": { "clusterRole": "system:aggregate-to-edit" }
        }));
        assert!(validate_root_sync_spec(&s).is_ok());
    }

    #[test]
    fn test_unsupported_source_type() {
        let s = spec(serde_json::json!({
            "sourceType": "oci",
            "git": { "repo": "https://example.com/r.git", "auth": "none" }
        }));
        let err = validate_root_sync_spec(&s).unwrap_err();
        assert!(err.to_string().contains("sourceType"));
    }

    #[test]
    fn test_missing_git_block() {
        let s = spec(serde_json::json!({}));
        assert!(validate_root_sync_spec(&s).is_err());
    }

    #[test]
    fn test_bad_format_and_depth() {
        let s = spec(serde_json::json!({
            "sourceFormat": "flat",
            "git": { "repo": "r", "auth": "none" }
        }));
        assert!(validate_root_sync_spec(&s).is_err());

        let s = spec(serde_json::json!({
            "git": { "repo": "r", "auth": "none" },
            "override": { "gitSyncDepth": -1 }
        }));
        assert!(validate_root_sync_spec(&s).is_err());
    }
}
