//! Environment overrides applied on top of the parsed file.

use crate::error::ConfigError;

use super::Config;

/// Apply `RELAY_*` overrides and resolve the API key.
///
/// Key precedence: `RELAY_API_KEY`, then inline `api.api_key`, then the env
/// var named by `api.api_key_env`.
pub(super) fn apply_env_overrides<FEnv>(
    config: &mut Config,
    env_lookup: &FEnv,
) -> Result<(), ConfigError>
where
    FEnv: Fn(&str) -> Option<String>,
{
    if let Some(url) = non_empty(env_lookup("RELAY_BASE_URL")) {
        config.api.base_url = url;
    }
    if let Some(model) = non_empty(env_lookup("RELAY_MODEL")) {
        config.api.model = model;
    }
    if let Some(raw) = non_empty(env_lookup("RELAY_MAX_ITERATIONS")) {
        let parsed = raw.parse::<usize>().map_err(|_| {
            ConfigError::Invalid(format!(
                "invalid RELAY_MAX_ITERATIONS value `{raw}`: expected a positive integer"
            ))
        })?;
        config.agent.max_iterations = parsed.max(1);
    }

    if let Some(key) = non_empty(env_lookup("RELAY_API_KEY")) {
        config.api.api_key = key;
    } else if config.api.api_key.trim().is_empty() {
        if let Some(name) = config.api.api_key_env.as_deref() {
            if let Some(key) = non_empty(env_lookup(name)) {
                config.api.api_key = key;
            }
        }
    }
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
