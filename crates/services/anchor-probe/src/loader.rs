//! Configuration loader with layered merge and env overrides.
//!
//! The loading process:
//! 1. Read global config from `~/.config/anchor-probe/anchor-probe.json`
//! 2. Read local config from `./anchor-probe.json`, or the explicit `--config` file
//! 3. Deep merge at JSON Value level (RFC 7396)
//! 4. Deserialize once into typed ProbeConfig
//! 5. Apply env var overrides
//! 6. Collect advisory warnings
//!
//! Command-line flags are applied by the caller on top of the result.

use crate::config::{AdvisoryWarning, ProbeConfig};
use anyhow::{Context, Result};
use atomicwrites::{AllowOverwrite, AtomicFile};
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Filename for local config.
pub const LOCAL_FILE: &str = "anchor-probe.json";

/// Directory name under config_dir for global config.
pub const GLOBAL_DIR: &str = "anchor-probe";

/// Filename for global config.
pub const GLOBAL_FILE: &str = "anchor-probe.json";

/// Resolved paths for config files.
#[derive(Debug, Clone)]
pub struct ProbeConfigPaths {
    /// Path to the local or explicit config.
    pub local: PathBuf,

    /// Path to the global config.
    pub global: PathBuf,
}

/// Result of loading configuration.
#[derive(Debug)]
pub struct LoadedProbeConfig {
    /// The loaded and merged configuration.
    pub config: ProbeConfig,

    /// Advisory warnings.
    pub warnings: Vec<AdvisoryWarning>,

    /// Resolved config file paths.
    pub paths: ProbeConfigPaths,
}

/// Get the global config file path.
pub fn global_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("Could not determine config dir")?;
    Ok(base.join(GLOBAL_DIR).join(GLOBAL_FILE))
}

/// Get the local config file path for a given directory.
pub fn local_config_path(local_dir: &Path) -> PathBuf {
    local_dir.join(LOCAL_FILE)
}

/// Load and merge configuration.
///
/// # Precedence (lowest to highest)
/// 1. Default values
/// 2. Global config
/// 3. Local config (`./anchor-probe.json`), or `explicit` when given
/// 4. Environment variables
///
/// An explicit path must exist; the implicit files are optional.
pub fn load_merged(local_dir: &Path, explicit: Option<&Path>) -> Result<LoadedProbeConfig> {
    let global_path = global_config_path()?;
    let local_path = match explicit {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            path.to_path_buf()
        }
        None => local_config_path(local_dir),
    };
    load_from_paths(global_path, local_path)
}

/// Merge `local` over `global`, then apply env overrides.
pub fn load_from_paths(global_path: PathBuf, local_path: PathBuf) -> Result<LoadedProbeConfig> {
    let global_v = read_json_object_or_empty(&global_path)?;
    let local_v = read_json_object_or_empty(&local_path)?;

    let merged = merge_patch(global_v, local_v);

    let mut cfg: ProbeConfig =
        serde_json::from_value(merged).context("Failed to deserialize merged probe config")?;

    apply_env_overrides(&mut cfg)?;

    let warnings = cfg.advisories();
    for warning in &warnings {
        debug!("Config advisory: {}", warning);
    }

    Ok(LoadedProbeConfig {
        config: cfg,
        warnings,
        paths: ProbeConfigPaths {
            local: local_path,
            global: global_path,
        },
    })
}

/// Apply environment variable overrides to the config.
fn apply_env_overrides(cfg: &mut ProbeConfig) -> Result<()> {
    if let Some(v) = env_trimmed("ANCHOR_PROBE_HOST") {
        cfg.host = v;
    }
    if let Some(v) = env_trimmed("ANCHOR_PROBE_PORT") {
        cfg.port = v
            .parse()
            .with_context(|| format!("ANCHOR_PROBE_PORT is not a port: {v}"))?;
    }
    if let Some(v) = env_trimmed("ANCHOR_PROBE_DELAY_MS") {
        cfg.delay_ms = v
            .parse()
            .with_context(|| format!("ANCHOR_PROBE_DELAY_MS is not a number: {v}"))?;
    }
    if let Some(v) = env_trimmed("ANCHOR_PROBE_READ_TIMEOUT_MS") {
        cfg.read_timeout_ms = v
            .parse()
            .with_context(|| format!("ANCHOR_PROBE_READ_TIMEOUT_MS is not a number: {v}"))?;
    }
    Ok(())
}

/// Helper to read and normalize an env var (trim + filter empty).
fn env_trimmed(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Read a JSON file as a Value, returning empty object if file doesn't exist.
fn read_json_object_or_empty(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Ok(Value::Object(Default::default()));
    }

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let v: Value = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid JSON in {}", path.display()))?;

    match v {
        Value::Object(_) => Ok(v),
        _ => anyhow::bail!("Config root must be a JSON object: {}", path.display()),
    }
}

/// Apply RFC 7396-style JSON merge patch.
///
/// Objects merge recursively, `null` deletes a key, arrays and scalars
/// replace.
pub fn merge_patch(target: Value, patch: Value) -> Value {
    match (target, patch) {
        (Value::Object(mut target_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                if patch_value.is_null() {
                    target_map.remove(&key);
                    continue;
                }

                let existing = target_map.remove(&key).unwrap_or(Value::Null);
                let merged = merge_patch(existing, patch_value);
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, patch) => patch,
    }
}

/// Write a JSON Value to a file atomically with pretty formatting.
pub fn write_pretty_json_atomic(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(value).context("Failed to serialize config to JSON")?;

    let af = AtomicFile::new(path, AllowOverwrite);
    af.write(|f| f.write_all(json.as_bytes()))
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serial_test::serial;
    use tempfile::TempDir;

    fn paths(temp: &TempDir) -> (PathBuf, PathBuf) {
        (
            temp.path().join("global").join(GLOBAL_FILE),
            temp.path().join(LOCAL_FILE),
        )
    }

    #[test]
    #[serial]
    fn test_load_no_files_returns_defaults() {
        let temp = TempDir::new().unwrap();
        let (global, local) = paths(&temp);
        let loaded = load_from_paths(global, local).unwrap();

        assert_eq!(loaded.config, ProbeConfig::default());
        assert!(loaded.warnings.is_empty());
    }

    #[test]
    #[serial]
    fn test_local_overrides_global() {
        let temp = TempDir::new().unwrap();
        let (global, local) = paths(&temp);
        write_pretty_json_atomic(
            &global,
            &json!({"host": "global.example", "port": 4000, "targets": {"lo": 10, "hi": 20}}),
        )
        .unwrap();
        std::fs::write(&local, r#"{"port": 5000, "targets": {"hi": 30}}"#).unwrap();

        let loaded = load_from_paths(global, local.clone()).unwrap();
        assert_eq!(loaded.config.host, "global.example");
        assert_eq!(loaded.config.port, 5000);
        assert_eq!(loaded.config.targets.lo, 10);
        assert_eq!(loaded.config.targets.hi, 30);
        assert_eq!(loaded.paths.local, local);
    }

    #[test]
    #[serial]
    fn test_env_overrides_files() {
        let temp = TempDir::new().unwrap();
        let (global, local) = paths(&temp);
        std::fs::write(&local, r#"{"host": "file.example", "delay_ms": 50}"#).unwrap();

        // SAFETY: This test runs serially via #[serial] to avoid data races
        unsafe {
            std::env::set_var("ANCHOR_PROBE_HOST", " env.example ");
            std::env::set_var("ANCHOR_PROBE_DELAY_MS", "0");
        }

        let loaded = load_from_paths(global, local).unwrap();

        // SAFETY: This test runs serially via #[serial] to avoid data races
        unsafe {
            std::env::remove_var("ANCHOR_PROBE_HOST");
            std::env::remove_var("ANCHOR_PROBE_DELAY_MS");
        }

        assert_eq!(loaded.config.host, "env.example");
        assert_eq!(loaded.config.delay_ms, 0);
        assert!(loaded.warnings.iter().any(|w| w.code == "delay.zero"));
    }

    #[test]
    #[serial]
    fn test_bad_env_port_errors() {
        let temp = TempDir::new().unwrap();
        let (global, local) = paths(&temp);

        // SAFETY: This test runs serially via #[serial] to avoid data races
        unsafe {
            std::env::set_var("ANCHOR_PROBE_PORT", "http");
        }
        let result = load_from_paths(global, local);
        // SAFETY: This test runs serially via #[serial] to avoid data races
        unsafe {
            std::env::remove_var("ANCHOR_PROBE_PORT");
        }

        assert!(result.unwrap_err().to_string().contains("ANCHOR_PROBE_PORT"));
    }

    #[test]
    #[serial]
    fn test_invalid_json_errors() {
        let temp = TempDir::new().unwrap();
        let (global, local) = paths(&temp);
        std::fs::write(&local, "not valid json").unwrap();

        let err = load_from_paths(global, local).unwrap_err();
        assert!(err.to_string().contains("Invalid JSON"));
    }

    #[test]
    #[serial]
    fn test_non_object_root_errors() {
        let temp = TempDir::new().unwrap();
        let (global, local) = paths(&temp);
        std::fs::write(&local, "[1, 2, 3]").unwrap();

        let err = load_from_paths(global, local).unwrap_err();
        assert!(err.to_string().contains("must be a JSON object"));
    }

    #[test]
    fn test_missing_explicit_config_errors() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("nope.json");
        let err = load_merged(temp.path(), Some(&missing)).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn test_merge_patch_semantics() {
        let target = json!({"host": "a", "targets": {"lo": 1, "hi": 2}, "anchor_order": [1, 2]});
        let patch = json!({"targets": {"hi": 5}, "anchor_order": [3], "host": null});
        assert_eq!(
            merge_patch(target, patch),
            json!({"targets": {"lo": 1, "hi": 5}, "anchor_order": [3]})
        );
    }

    #[test]
    fn test_write_creates_parent_dirs() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("dir").join(LOCAL_FILE);
        write_pretty_json_atomic(&path, &json!({"port": 1})).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"port\": 1"));
    }
}
