use std::{
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use tracing::debug;

use crate::{env_subst::substitute_env, schema::GatewayConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "switchyard.toml",
    "switchyard.yaml",
    "switchyard.yml",
    "switchyard.json",
];

/// Override for the config directory, set via `set_config_dir()`.
static CONFIG_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Lock guarding config read-modify-write cycles.
static CONFIG_SAVE_LOCK: Mutex<()> = Mutex::new(());

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Restrict config discovery to `path`. Each call replaces the previous
/// override.
pub fn set_config_dir(path: PathBuf) {
    *lock(&CONFIG_DIR_OVERRIDE) = Some(path);
}

pub fn clear_config_dir() {
    *lock(&CONFIG_DIR_OVERRIDE) = None;
}

fn config_dir_override() -> Option<PathBuf> {
    lock(&CONFIG_DIR_OVERRIDE).clone()
}

/// Load config from the given path (any supported format), then apply
/// environment overrides.
pub fn load_config(path: &Path) -> anyhow::Result<GatewayConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    let mut config = parse_config(&raw, path)?;
    config.apply_env();
    Ok(config)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./switchyard.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/switchyard/switchyard.{toml,yaml,yml,json}` (user-global)
///
/// Falls back to `GatewayConfig::default()` (plus env overrides) only when
/// no file is found. A file that exists but fails to load is an error.
pub fn discover_and_load() -> anyhow::Result<GatewayConfig> {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        return load_config(&path).map_err(|e| e.context(format!("invalid config {}", path.display())));
    }
    debug!("no config file found, using defaults");
    let mut config = GatewayConfig::default();
    config.apply_env();
    Ok(config)
}

/// Find the first config file in standard locations.
///
/// When a config dir override is set, only that directory is searched.
fn find_config_file() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return first_existing(&dir);
    }

    if let Some(p) = first_existing(Path::new(".")) {
        return Some(p);
    }

    config_dir().and_then(|dir| first_existing(&dir))
}

fn first_existing(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the config directory: override, or `~/.config/switchyard/`.
pub fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return Some(dir);
    }
    directories::BaseDirs::new().map(|d| d.home_dir().join(".config").join("switchyard"))
}

/// Returns the path of an existing config file, or the default TOML path.
pub fn find_or_default_config_path() -> PathBuf {
    if let Some(path) = find_config_file() {
        return path;
    }
    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("switchyard.toml")
}

/// Atomically load the current config, apply `f`, and save it back as TOML.
///
/// Used by operator commands such as persisting a freshly generated token.
/// Returns the path written to.
pub fn update_config(f: impl FnOnce(&mut GatewayConfig)) -> anyhow::Result<PathBuf> {
    let _guard = lock(&CONFIG_SAVE_LOCK);
    let path = find_or_default_config_path();
    let mut config = if path.exists() {
        let raw = std::fs::read_to_string(&path)?;
        parse_config(&raw, &path)?
    } else {
        GatewayConfig::default()
    };
    f(&mut config);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let serialized = serialize_config(&config, &path)?;
    std::fs::write(&path, serialized)?;
    debug!(path = %path.display(), "saved config");
    Ok(path)
}

fn extension(path: &Path) -> &str {
    path.extension().and_then(|e| e.to_str()).unwrap_or("toml")
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<GatewayConfig> {
    match extension(path) {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        ext => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

fn serialize_config(config: &GatewayConfig, path: &Path) -> anyhow::Result<String> {
    match extension(path) {
        "toml" => toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("serialize config: {e}")),
        "yaml" | "yml" => Ok(serde_yaml::to_string(config)?),
        "json" => Ok(serde_json::to_string_pretty(config)?),
        ext => anyhow::bail!("unsupported config format: .{ext}"),
    }
}
