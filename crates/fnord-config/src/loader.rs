// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Configuration loading.
//!
//! Layers, lowest to highest priority:
//!
//! 1. system and user files (`/etc/fnord/config.yaml`, `~/.config/fnord/...`);
//! 2. the project file: `.fnord/config.yaml` found by walking up from the
//!    working directory, the same way the project root itself is located;
//! 3. an explicit `--config` path;
//! 4. `FNORD_*` environment overrides (`FNORD_MODEL`, `FNORD_BASE_URL`,
//!    `FNORD_CONTEXT_TOKENS`, `FNORD_PROJECT`).
//!
//! File layers are deep-merged mapping-wise with later scalars winning;
//! environment overrides land on the typed [`Config`] after decoding.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Load the effective configuration.  A missing explicit path is an error;
/// missing discovered layers are not.
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut layers: Vec<PathBuf> = system_and_user_paths()
        .into_iter()
        .filter(|p| p.is_file())
        .collect();
    if let Some(project) = std::env::current_dir()
        .ok()
        .and_then(|cwd| find_project_config(&cwd))
    {
        layers.push(project);
    }
    if let Some(p) = extra {
        anyhow::ensure!(p.is_file(), "config file not found: {}", p.display());
        layers.push(p.to_path_buf());
    }

    let mut merged: Option<serde_yaml::Value> = None;
    for path in layers {
        debug!(path = %path.display(), "loading config layer");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let layer: serde_yaml::Value = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        merged = Some(match merged {
            Some(base) => overlay(base, layer),
            None => layer,
        });
    }

    let mut config = match merged {
        Some(value) => serde_yaml::from_value(value)
            .context("interpreting merged configuration")?,
        None => Config::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

fn system_and_user_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/fnord/config.yaml")];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/fnord/config.yaml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("fnord/config.yaml"));
    }
    paths
}

/// Walk up from `start` looking for `.fnord/config.yaml`.  The first hit is
/// the project's config; the containing directory is the project root.
pub fn find_project_config(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(".fnord/config.yaml");
        if candidate.is_file() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Deep-merge `over` onto `base`: mappings merge key-wise, everything else
/// is replaced by `over`.
fn overlay(base: serde_yaml::Value, over: serde_yaml::Value) -> serde_yaml::Value {
    match (base, over) {
        (serde_yaml::Value::Mapping(mut b), serde_yaml::Value::Mapping(o)) => {
            for (key, value) in o {
                let merged = match b.remove(&key) {
                    Some(prev) => overlay(prev, value),
                    None => value,
                };
                b.insert(key, merged);
            }
            serde_yaml::Value::Mapping(b)
        }
        (_, over) => over,
    }
}

fn apply_env_overrides(config: &mut Config) {
    apply_overrides(config, |key| {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    });
}

/// Apply `FNORD_*` overrides from `lookup` onto the decoded config.  The
/// lookup indirection keeps this testable without mutating process state.
fn apply_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(name) = lookup("FNORD_MODEL") {
        config.model.name = name;
    }
    if let Some(url) = lookup("FNORD_BASE_URL") {
        config.model.base_url = url;
    }
    if let Some(tokens) = lookup("FNORD_CONTEXT_TOKENS") {
        match tokens.parse() {
            Ok(n) => config.model.context_tokens = n,
            Err(_) => debug!(%tokens, "ignoring unparseable FNORD_CONTEXT_TOKENS"),
        }
    }
    if let Some(project) = lookup("FNORD_PROJECT") {
        config.project = Some(project);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    // ── overlay ───────────────────────────────────────────────────────────────

    #[test]
    fn overlay_scalar_later_wins() {
        let merged = overlay(val("x: 1"), val("x: 2"));
        assert_eq!(merged["x"].as_i64(), Some(2));
    }

    #[test]
    fn overlay_keeps_keys_absent_from_the_upper_layer() {
        let merged = overlay(val("a: 1\nb: 2"), val("b: 99"));
        assert_eq!(merged["a"].as_i64(), Some(1));
        assert_eq!(merged["b"].as_i64(), Some(99));
    }

    #[test]
    fn overlay_merges_nested_mappings() {
        let merged = overlay(
            val("model:\n  name: gpt-4o\n  context_tokens: 128000"),
            val("model:\n  name: gpt-5-mini"),
        );
        assert_eq!(merged["model"]["name"].as_str(), Some("gpt-5-mini"));
        assert_eq!(merged["model"]["context_tokens"].as_i64(), Some(128000));
    }

    #[test]
    fn overlay_replaces_mapping_with_scalar() {
        let merged = overlay(val("model:\n  name: x"), val("model: disabled"));
        assert_eq!(merged["model"].as_str(), Some("disabled"));
    }

    // ── project discovery ─────────────────────────────────────────────────────

    #[test]
    fn project_config_found_from_nested_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join(".fnord")).unwrap();
        std::fs::write(root.join(".fnord/config.yaml"), "project: demo\n").unwrap();
        let nested = root.join("src/deep/module");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_project_config(&nested).unwrap();
        assert_eq!(found, root.join(".fnord/config.yaml"));
    }

    #[test]
    fn nearest_project_config_wins() {
        let dir = tempfile::tempdir().unwrap();
        let outer = dir.path();
        let inner = outer.join("vendored/subproject");
        for base in [outer, inner.as_path()] {
            std::fs::create_dir_all(base.join(".fnord")).unwrap();
            std::fs::write(base.join(".fnord/config.yaml"), "project: x\n").unwrap();
        }
        let found = find_project_config(&inner).unwrap();
        assert_eq!(found, inner.join(".fnord/config.yaml"));
    }

    #[test]
    fn no_project_config_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_project_config(dir.path()).is_none());
    }

    // ── environment overrides ─────────────────────────────────────────────────

    fn env<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn env_overrides_model_and_base_url() {
        let mut config = Config::default();
        apply_overrides(
            &mut config,
            env(&[
                ("FNORD_MODEL", "gpt-5-mini"),
                ("FNORD_BASE_URL", "http://localhost:8080/v1"),
            ]),
        );
        assert_eq!(config.model.name, "gpt-5-mini");
        assert_eq!(config.model.base_url, "http://localhost:8080/v1");
    }

    #[test]
    fn env_overrides_context_tokens_when_numeric() {
        let mut config = Config::default();
        apply_overrides(&mut config, env(&[("FNORD_CONTEXT_TOKENS", "32000")]));
        assert_eq!(config.model.context_tokens, 32_000);
    }

    #[test]
    fn unparseable_context_tokens_is_ignored() {
        let mut config = Config::default();
        let before = config.model.context_tokens;
        apply_overrides(&mut config, env(&[("FNORD_CONTEXT_TOKENS", "lots")]));
        assert_eq!(config.model.context_tokens, before);
    }

    #[test]
    fn env_selects_the_project() {
        let mut config = Config::default();
        apply_overrides(&mut config, env(&[("FNORD_PROJECT", "fnord")]));
        assert_eq!(config.project.as_deref(), Some("fnord"));
    }

    #[test]
    fn absent_vars_change_nothing() {
        let mut config = Config::default();
        let name = config.model.name.clone();
        apply_overrides(&mut config, env(&[]));
        assert_eq!(config.model.name, name);
        assert!(config.project.is_none());
    }

    // ── load ──────────────────────────────────────────────────────────────────

    #[test]
    fn load_returns_error_when_explicit_path_missing() {
        let result = load(Some(Path::new("/tmp/fnord_nonexistent_config_xyz.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_explicit_file_overrides_defaults() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "model:\n  name: test-model\n  context_tokens: 9000").unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.model.name, "test-model");
        assert_eq!(cfg.model.context_tokens, 9000);
    }

    #[test]
    fn load_rejects_a_malformed_explicit_file() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "model:\n  context_tokens: not-a-number").unwrap();
        assert!(load(Some(f.path())).is_err());
    }
}
