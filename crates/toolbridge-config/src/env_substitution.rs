use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::env;
use toolbridge_core::{Result, ToolbridgeError};

// Supports both ${VAR} and ${VAR:-default}
static ENV_VAR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("Invalid regex pattern")
});

/// Substitute environment variables in a single string.
///
/// Variables without a default that are not set are reported together in
/// one configuration error.
pub fn substitute(input: &str) -> Result<String> {
    let mut missing_vars = Vec::new();

    let result = ENV_VAR_REGEX.replace_all(input, |caps: &regex::Captures<'_>| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => match caps.get(2) {
                Some(default) => default.as_str().to_string(),
                None => {
                    missing_vars.push(var_name.to_string());
                    caps[0].to_string()
                }
            },
        }
    });

    if !missing_vars.is_empty() {
        return Err(ToolbridgeError::Config(format!(
            "Missing required environment variables: {}",
            missing_vars.join(", ")
        )));
    }

    Ok(result.into_owned())
}

/// Resolve every value of a map, keeping keys untouched.
pub fn substitute_map(values: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
    values
        .iter()
        .map(|(key, value)| Ok((key.clone(), substitute(value)?)))
        .collect()
}
