//! Environment merging for container launches.

use std::collections::HashMap;

/// Merge app-level secrets with service-level env vars. Service values win
/// key-by-key; neither input is mutated.
pub fn merge_env(
    app_secrets: &HashMap<String, String>,
    service_env: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = app_secrets.clone();
    for (key, value) in service_env {
        merged.insert(key.clone(), value.clone());
    }
    merged
}
