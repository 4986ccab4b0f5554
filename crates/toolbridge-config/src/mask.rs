//! Masking of secrets for display, and restoring them on save.

use std::collections::BTreeMap;

use crate::{McpConfigDocument, ServerConfig};

/// Placeholder shown instead of a secret value.
pub const MASK: &str = "***";

const SENSITIVE_ENV_MARKERS: &[&str] = &["KEY", "TOKEN", "SECRET", "PASSWORD"];
const SENSITIVE_HEADER_MARKERS: &[&str] = &["AUTHORIZATION", "TOKEN", "KEY", "SECRET"];

pub fn is_sensitive_env_key(key: &str) -> bool {
    contains_marker(key, SENSITIVE_ENV_MARKERS)
}

pub fn is_sensitive_header(key: &str) -> bool {
    contains_marker(key, SENSITIVE_HEADER_MARKERS)
}

fn contains_marker(key: &str, markers: &[&str]) -> bool {
    let upper = key.to_ascii_uppercase();
    markers.iter().any(|marker| upper.contains(marker))
}

fn mask_map(values: &BTreeMap<String, String>, sensitive: fn(&str) -> bool) -> BTreeMap<String, String> {
    values
        .iter()
        .map(|(key, value)| {
            let shown = if sensitive(key) && !value.is_empty() {
                MASK.to_string()
            } else {
                value.clone()
            };
            (key.clone(), shown)
        })
        .collect()
}

fn restore_map(incoming: &mut BTreeMap<String, String>, stored: &BTreeMap<String, String>) {
    for (key, value) in incoming.iter_mut() {
        if value == MASK {
            if let Some(original) = stored.get(key) {
                value.clone_from(original);
            }
        }
    }
}

impl ServerConfig {
    /// Copy suitable for display, with secrets replaced by [`MASK`].
    pub fn masked(&self) -> Self {
        Self {
            env: mask_map(&self.env, is_sensitive_env_key),
            headers: mask_map(&self.headers, is_sensitive_header),
            ..self.clone()
        }
    }

    /// Put back stored secrets wherever this config still holds [`MASK`].
    pub fn restore_masked(&mut self, stored: &ServerConfig) {
        restore_map(&mut self.env, &stored.env);
        restore_map(&mut self.headers, &stored.headers);
    }
}

impl McpConfigDocument {
    pub fn masked(&self) -> Self {
        Self {
            enabled: self.enabled,
            servers: self
                .servers
                .iter()
                .map(|(name, server)| (name.clone(), server.masked()))
                .collect(),
        }
    }

    pub fn restore_masked(&mut self, stored: &McpConfigDocument) {
        for (name, server) in self.servers.iter_mut() {
            if let Some(original) = stored.servers.get(name) {
                server.restore_masked(original);
            }
        }
    }
}
