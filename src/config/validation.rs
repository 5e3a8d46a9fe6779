//! Configuration validation.

use crate::config::{Config, ForwardRule};
use std::collections::HashSet;
use tokio::sync::Semaphore;

/// Validate the configuration.
///
/// Checks for:
/// - At least one forwarding rule
/// - Every rule passing [`validate_rule`]
/// - Unique rule names
/// - No two enabled rules sharing a listen address
/// - A known log level
///
/// The proxy URL is deliberately left alone: a malformed one only fails the
/// sessions that try to use it.
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing the problem.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    if config.forwards.is_empty() {
        errors.push("at least one forward rule must be defined".to_string());
    }

    let mut names = HashSet::new();
    let mut listen_addresses = HashSet::new();

    for rule in &config.forwards {
        if let Err(e) = validate_rule(rule) {
            errors.push(e);
        }

        if let Some(name) = &rule.name {
            if !names.insert(name.as_str()) {
                errors.push(format!("duplicate forward name: {}", name));
            }
        }

        if rule.enabled && !listen_addresses.insert(rule.listen_address()) {
            errors.push(format!(
                "duplicate local address: {} (forward: {})",
                rule.listen_address(),
                rule.display_name()
            ));
        }
    }

    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

/// Validate a single forwarding rule.
pub fn validate_rule(rule: &ForwardRule) -> Result<(), String> {
    let mut errors = Vec::new();
    let name = rule.display_name();

    let local = rule.local_port.trim();
    if local.is_empty() {
        errors.push(format!("forward '{}' has no local port", name));
    } else {
        let port = local.rsplit(':').next().unwrap_or(local);
        if port.parse::<u16>().is_err() {
            errors.push(format!(
                "forward '{}' has invalid local port '{}'",
                name, rule.local_port
            ));
        }
    }

    if rule.remote_host.trim().is_empty() {
        errors.push(format!("forward '{}' has no remote host", name));
    }

    if rule.remote_port.trim().parse::<u16>().is_err() {
        errors.push(format!(
            "forward '{}' has invalid remote port '{}'",
            name, rule.remote_port
        ));
    }

    match rule.max_connections {
        Some(0) => errors.push(format!(
            "forward '{}' has max_connections 0 (must be >= 1)",
            name
        )),
        Some(limit) if limit > Semaphore::MAX_PERMITS => errors.push(format!(
            "forward '{}' has max_connections {} (must be <= {})",
            name,
            limit,
            Semaphore::MAX_PERMITS
        )),
        _ => {}
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}
