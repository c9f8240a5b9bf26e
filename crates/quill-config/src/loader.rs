// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest
/// priority.  Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/quill/config.yaml"));
    paths.push(PathBuf::from("/etc/quill/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/quill/config.yaml"));
        paths.push(home.join(".config/quill/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("quill/config.yaml"));
        paths.push(cfg.join("quill/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".quill/config.yaml"));
    paths.push(PathBuf::from(".quill/config.yml"));
    paths.push(PathBuf::from(".quill.yaml"));
    paths.push(PathBuf::from(".quill.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files.
/// The `extra` argument may provide an explicit path (e.g. a CLI flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let mut config: Config = serde_yaml::from_value(merged).context("deserializing config")?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Environment variables honoured by the core itself.  Model selection and
/// API keys are the provider layer's concern and are not read here.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(raw) = std::env::var("AGENT_REQUEST_TIMEOUT_MS") {
        match raw.parse::<u64>() {
            Ok(ms) => config.agent.request_timeout_ms = Some(ms),
            Err(_) => {
                tracing::warn!(value = %raw, "ignoring unparseable AGENT_REQUEST_TIMEOUT_MS");
            }
        }
    }
}

/// Recursively merge `layer` into `base`.  Mappings merge key-by-key; any
/// other value type replaces the base wholesale.
fn merge_yaml(base: &mut serde_yaml::Value, layer: serde_yaml::Value) {
    match (base, layer) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(layer_map)) => {
            for (k, v) in layer_map {
                match base_map.get_mut(&k) {
                    Some(existing) => merge_yaml(existing, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (base_slot, layer_value) => *base_slot = layer_value,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
