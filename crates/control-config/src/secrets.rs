//! Secret resolution — the single source of truth for runtime secrets.
//!
//! Config YAML stores only env var **NAMES**. `resolve_secrets` reads the
//! environment once at startup; the result is passed into constructors.
//! Every secret-carrying struct redacts its `Debug` output, and error
//! messages name the env var, never its value.

use anyhow::{bail, Result};
use serde_json::Value;

/// Secrets the deploy/worktree drivers need. All optional: a core instance
/// wired to fake drivers (tests) needs none of them.
#[derive(Clone)]
pub struct ResolvedSecrets {
    /// Git credential used for non-interactive `push` to `origin`.
    pub git_push_token: Option<String>,
    /// Bearer token the deploy hook uses to authenticate its reload call.
    pub deploy_hook_token: Option<String>,
    /// Webhook used to notify on merged/failed runs; optional in every mode.
    pub notify_webhook_url: Option<String>,
}

impl std::fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSecrets")
            .field(
                "git_push_token",
                &self.git_push_token.as_ref().map(|_| "<REDACTED>"),
            )
            .field(
                "deploy_hook_token",
                &self.deploy_hook_token.as_ref().map(|_| "<REDACTED>"),
            )
            .field(
                "notify_webhook_url",
                &self.notify_webhook_url.as_ref().map(|_| "<REDACTED>"),
            )
            .finish()
    }
}

struct SecretEnvNames {
    git_push_token_var: String,
    deploy_hook_token_var: String,
    notify_webhook_var: Option<String>,
}

fn read_str_at(config: &Value, pointer: &str) -> Option<String> {
    let s = config.pointer(pointer)?.as_str()?;
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn resolve_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

fn parse_env_names(config_json: &Value) -> SecretEnvNames {
    SecretEnvNames {
        git_push_token_var: read_str_at(config_json, "/secrets/git_push_token_env")
            .unwrap_or_else(|| "CODEX_GIT_PUSH_TOKEN".to_string()),
        deploy_hook_token_var: read_str_at(config_json, "/secrets/deploy_hook_token_env")
            .unwrap_or_else(|| "CODEX_DEPLOY_HOOK_TOKEN".to_string()),
        notify_webhook_var: read_str_at(config_json, "/secrets/notify_webhook_env"),
    }
}

/// Resolve secrets for the given deploy mode (`"live"` requires a push
/// token and a deploy-hook token; `"dry_run"` requires neither).
pub fn resolve_secrets(config_json: &Value, mode: &str) -> Result<ResolvedSecrets> {
    let names = parse_env_names(config_json);
    let mode_lower = mode.trim().to_ascii_lowercase();

    let git_push_token = resolve_env(&names.git_push_token_var);
    let deploy_hook_token = resolve_env(&names.deploy_hook_token_var);

    match mode_lower.as_str() {
        "live" => {
            if git_push_token.is_none() {
                bail!(
                    "SECRETS_MISSING mode=live: required env var '{}' (git push token) is not set or empty",
                    names.git_push_token_var,
                );
            }
            if deploy_hook_token.is_none() {
                bail!(
                    "SECRETS_MISSING mode=live: required env var '{}' (deploy hook token) is not set or empty",
                    names.deploy_hook_token_var,
                );
            }
        }
        "dry_run" => {}
        other => {
            bail!(
                "SECRETS_UNKNOWN_MODE: unrecognised mode '{}'; expected one of: live | dry_run",
                other,
            );
        }
    }

    let notify_webhook_url = names.notify_webhook_var.as_deref().and_then(resolve_env);

    Ok(ResolvedSecrets {
        git_push_token,
        deploy_hook_token,
        notify_webhook_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_all_fields() {
        let secrets = ResolvedSecrets {
            git_push_token: Some("ghp_secret".to_string()),
            deploy_hook_token: Some("dh_secret".to_string()),
            notify_webhook_url: Some("https://hooks.example/abc".to_string()),
        };
        let rendered = format!("{secrets:?}");
        assert!(!rendered.contains("ghp_secret"));
        assert!(!rendered.contains("dh_secret"));
        assert!(!rendered.contains("hooks.example"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn dry_run_mode_requires_nothing() {
        let cfg = serde_json::json!({});
        let resolved = resolve_secrets(&cfg, "dry_run").unwrap();
        assert!(resolved.git_push_token.is_none());
    }

    #[test]
    fn unknown_mode_rejected() {
        let cfg = serde_json::json!({});
        assert!(resolve_secrets(&cfg, "bogus").is_err());
    }
}
