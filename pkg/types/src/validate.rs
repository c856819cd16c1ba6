use anyhow::{Result, bail};

use crate::rbac::RoleBinding;
use crate::selector::LabelSelector;

/// Validate a Kubernetes-style resource name.
/// Rules: lowercase `[a-z0-9-]`, max 63 chars, no leading/trailing hyphens.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("name must not be empty");
    }
    if name.len() > 63 {
        bail!("name '{}' exceeds 63 characters (got {})", name, name.len());
    }
    if name.starts_with('-') || name.ends_with('-') {
        bail!("name '{}' must not start or end with a hyphen", name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        bail!(
            "name '{}' must contain only lowercase letters, digits, and hyphens [a-z0-9-]",
            name
        );
    }
    Ok(())
}

/// Structural check run by the API before a RoleBinding is stored.
pub fn validate_role_binding(rb: &RoleBinding) -> Result<()> {
    validate_name(&rb.name)?;
    validate_name(&rb.spec.role_ref)?;
    validate_name(&rb.spec.team_ref)?;
    for ns in &rb.spec.namespaces {
        validate_name(ns)?;
    }
    let selector = &rb.spec.cluster_selector;
    if let Some(name) = &selector.name {
        validate_name(name)?;
    }
    if let Some(query) = &selector.label_selector {
        if let Err(e) = query.parse::<LabelSelector>() {
            bail!("clusterSelector.labelSelector: {}", e);
        }
    }
    Ok(())
}
