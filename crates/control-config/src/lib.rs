//! Layered configuration loading + the concrete control-plane config shape.
//!
//! Config is never a process-wide singleton: [`ControlConfig::from_layers`]
//! produces one immutable value at startup, passed explicitly to every
//! component that needs it.

pub mod secrets;

use std::fs;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Load + merge YAML files in order, then canonicalize to JSON and hash.
/// Later files override earlier files via deep-merge.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let s = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {p}"))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Ok(LoadedConfig {
        config_json: serde_json::from_str(&canonical).context("canonical json parse failed")?,
        canonical_json: canonical,
        config_hash: hash,
    })
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// The recognized configuration surface (spec §6). Every field has a
/// documented default; `from_layers` applies those defaults before
/// deserializing the merged JSON over them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub slot_ids: Vec<String>,
    pub slot_lease_ttl_seconds: i64,
    pub worktree_root: String,
    pub repo_root: String,
    pub main_branch: String,
    pub preview_db_name_template: String,
    pub seed_file_template: String,
    pub snapshot_file_template: String,
    pub deploy_reload_command: String,
    pub deploy_health_command: String,
    pub deploy_step_timeout_seconds: i64,
    pub merge_gate_recheck_required: bool,
    pub trace_header_name: String,
    /// Open Question #1 resolution (see DESIGN.md): whether a reaped
    /// still-editing lease transitions its run to `failed` instead of
    /// `expired`. Default `false` per the documented policy.
    pub expiry_transition_failed: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        ControlConfig {
            slot_ids: vec![
                "preview-1".to_string(),
                "preview-2".to_string(),
                "preview-3".to_string(),
            ],
            slot_lease_ttl_seconds: 1800,
            worktree_root: "/var/lib/codex/worktrees".to_string(),
            repo_root: "/var/lib/codex/repo".to_string(),
            main_branch: "main".to_string(),
            preview_db_name_template: "app_preview_{n}".to_string(),
            seed_file_template: "seeds/{slot_id}/{seed_version}.sql".to_string(),
            snapshot_file_template: "snapshots/{slot_id}/{snapshot_version}.sql".to_string(),
            deploy_reload_command: "/usr/local/bin/codex-deploy-reload".to_string(),
            deploy_health_command: "/usr/local/bin/codex-deploy-healthcheck".to_string(),
            deploy_step_timeout_seconds: 120,
            merge_gate_recheck_required: true,
            trace_header_name: "X-Trace-Id".to_string(),
            expiry_transition_failed: false,
        }
    }
}

impl ControlConfig {
    /// Build from layered YAML files, falling back to defaults for any
    /// field absent from every layer.
    pub fn from_layers(paths: &[&str]) -> Result<(Self, LoadedConfig)> {
        let loaded = load_layered_yaml(paths)?;
        let merged_over_defaults = merge_over_defaults(loaded.config_json.clone())?;
        let cfg: ControlConfig = serde_json::from_value(merged_over_defaults)
            .context("config does not match schema")?;
        Ok((cfg, loaded))
    }

    /// Compute the expected preview DB name for a slot, per the configured
    /// template. Does not validate the slot is in `slot_ids`.
    pub fn db_name_for_slot(&self, slot_id: &str) -> Option<String> {
        let n = slot_id.strip_prefix("preview-")?;
        Some(self.preview_db_name_template.replace("{n}", n))
    }
}

fn merge_over_defaults(overlay: Value) -> Result<Value> {
    let defaults = serde_json::to_value(ControlConfig::default())?;
    let mut merged = defaults;
    deep_merge(&mut merged, overlay);
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_when_layers_are_empty_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.yaml");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "{{}}").unwrap();

        let (cfg, _) = ControlConfig::from_layers(&[path.to_str().unwrap()]).unwrap();
        assert_eq!(cfg.slot_ids, vec!["preview-1", "preview-2", "preview-3"]);
        assert_eq!(cfg.slot_lease_ttl_seconds, 1800);
    }

    #[test]
    fn overlay_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("override.yaml");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "slot_lease_ttl_seconds: 60").unwrap();

        let (cfg, _) = ControlConfig::from_layers(&[path.to_str().unwrap()]).unwrap();
        assert_eq!(cfg.slot_lease_ttl_seconds, 60);
        assert_eq!(cfg.worktree_root, "/var/lib/codex/worktrees");
    }

    #[test]
    fn config_hash_is_stable_across_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.yaml");
        let b = dir.path().join("b.yaml");
        fs::write(&a, "one: 1\ntwo: 2\n").unwrap();
        fs::write(&b, "two: 2\none: 1\n").unwrap();

        let loaded_a = load_layered_yaml(&[a.to_str().unwrap()]).unwrap();
        let loaded_b = load_layered_yaml(&[b.to_str().unwrap()]).unwrap();
        assert_eq!(loaded_a.config_hash, loaded_b.config_hash);
    }

    #[test]
    fn db_name_for_slot_follows_template() {
        let cfg = ControlConfig::default();
        assert_eq!(
            cfg.db_name_for_slot("preview-2"),
            Some("app_preview_2".to_string())
        );
        assert_eq!(cfg.db_name_for_slot("staging"), None);
    }
}
