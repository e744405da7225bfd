//! Configuration loading and resolution.
//!
//! Config file lookup order:
//! 1. Explicit path from `--config`
//! 2. `./relay.toml`
//! 3. `~/.config/relay/relay.toml`
//! 4. Built-in defaults
//!
//! `RELAY_API_KEY`, `RELAY_BASE_URL`, `RELAY_MODEL` and
//! `RELAY_MAX_ITERATIONS` override whatever the file says.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

mod defaults;
mod env;
mod sources;
mod types;

pub use sources::ConfigSource;
pub use types::{
    AgentConfig, ApiConfig, Config, ContextConfig, HookConfig, HookKind, PermissionsConfig,
    WalConfig,
};

/// Configuration together with the source it was read from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub source: ConfigSource,
}

/// Load configuration from the standard sources.
pub fn load_config(path_override: Option<&str>) -> Result<LoadedConfig, ConfigError> {
    load_config_from_sources(
        path_override,
        |path| std::fs::read_to_string(path),
        |name| std::env::var(name).ok(),
        config_root_dir,
    )
}

fn load_config_from_sources<FRead, FEnv, FRoot>(
    path_override: Option<&str>,
    read_file: FRead,
    env_lookup: FEnv,
    config_root: FRoot,
) -> Result<LoadedConfig, ConfigError>
where
    FRead: Fn(&Path) -> Result<String, std::io::Error>,
    FEnv: Fn(&str) -> Option<String>,
    FRoot: Fn() -> Option<PathBuf>,
{
    let (text, source) =
        sources::read_config_text_with_sources(path_override, &read_file, &config_root)?;
    let mut config = parse_config(&text)?;
    env::apply_env_overrides(&mut config, &env_lookup)?;
    Ok(LoadedConfig { config, source })
}

/// Parse and validate config text without consulting the environment.
pub fn parse_config(text: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(text)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.agent.max_iterations == 0 {
        return Err(ConfigError::Invalid(
            "agent.max_iterations must be at least 1".into(),
        ));
    }
    let ctx = &config.context;
    if ctx.budget_tokens == 0 {
        return Err(ConfigError::Invalid(
            "context.budget_tokens must be positive".into(),
        ));
    }
    if !(ctx.target_fraction > 0.0 && ctx.target_fraction <= ctx.trigger_fraction) {
        return Err(ConfigError::Invalid(format!(
            "context.target_fraction ({}) must be in (0, trigger_fraction ({})]",
            ctx.target_fraction, ctx.trigger_fraction
        )));
    }
    for hook in &config.hooks {
        if hook.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "hooks.timeout_secs must be at least 1".into(),
            ));
        }
    }
    Ok(())
}

/// Platform config root (`~/.config` on Linux).
pub fn config_root_dir() -> Option<PathBuf> {
    dirs::config_dir()
}
