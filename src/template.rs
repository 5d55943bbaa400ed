//! `${namespace.key}` placeholders in service parameters.
//!
//! A placeholder is `${` followed by a non-empty name and a closing `}`.
//! Anything else, including an unterminated `${`, is copied verbatim.
//! Unknown names are handled per [`UnresolvedPolicy`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::warn;

use crate::config::ScalarTable;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unresolved template variable `{0}`")]
    Unresolved(String),
}

/// What to do with a placeholder that has no value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnresolvedPolicy {
    /// Keep `${name}` literally and log a warning.
    #[default]
    Warn,
    /// Fail resolution.
    Deny,
}

/// Filesystem locations every job exposes to its services.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub agent_workspace: PathBuf,
    pub local_servers: PathBuf,
    pub local_binary: PathBuf,
}

impl WorkspacePaths {
    /// Workspace plus the default `local_servers` / `local_binary` dirs
    /// under `root`, all made absolute.
    pub fn new(agent_workspace: impl AsRef<Path>, root: impl AsRef<Path>) -> Self {
        let root = absolute(root.as_ref());
        Self {
            agent_workspace: absolute(agent_workspace.as_ref()),
            local_servers: root.join("local_servers"),
            local_binary: root.join("local_binary"),
        }
    }
}

fn absolute(p: &Path) -> PathBuf {
    std::path::absolute(p).unwrap_or_else(|_| p.to_path_buf())
}

/// Flat variable table used to render placeholders.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    vars: BTreeMap<String, String>,
    policy: UnresolvedPolicy,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge workspace paths, `config.*`, and `token.*` (global secrets,
    /// then per-job overrides on top).
    pub fn build(
        workspace: &WorkspacePaths,
        container_runtime: Option<&str>,
        config: &ScalarTable,
        secrets: &ScalarTable,
        job_secrets: Option<&ScalarTable>,
    ) -> Self {
        let mut vars = Self::new();
        vars.insert("agent_workspace", workspace.agent_workspace.display().to_string());
        vars.insert("local_servers_paths", workspace.local_servers.display().to_string());
        vars.insert("local_binary_paths", workspace.local_binary.display().to_string());
        if let Some(rt) = container_runtime {
            vars.insert("podman_or_docker", rt);
        }
        vars.extend_scoped("config", config);
        vars.extend_scoped("token", secrets);
        if let Some(overrides) = job_secrets {
            vars.extend_scoped("token", overrides);
        }
        vars
    }

    pub fn with_policy(mut self, policy: UnresolvedPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> UnresolvedPolicy {
        self.policy
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Insert every entry of `table` as `<scope>.<key>`, replacing existing ones.
    pub fn extend_scoped(&mut self, scope: &str, table: &ScalarTable) {
        for (k, v) in table.iter() {
            self.vars.insert(format!("{scope}.{k}"), v.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }

    pub fn render(&self, input: &str) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                out.push_str(&rest[start..]);
                return Ok(out);
            };
            let name = &after[..end];
            if name.is_empty() {
                out.push_str("${}");
            } else if let Some(value) = self.vars.get(name) {
                out.push_str(value);
            } else {
                match self.policy {
                    UnresolvedPolicy::Warn => {
                        warn!(variable = name, "template variable not found, leaving as-is");
                        out.push_str(&rest[start..start + 2 + end + 1]);
                    }
                    UnresolvedPolicy::Deny => return Err(TemplateError::Unresolved(name.to_string())),
                }
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Render every string inside nested arrays and objects. Keys are left alone.
    pub fn resolve_value(&self, value: Value) -> Result<Value, TemplateError> {
        Ok(match value {
            Value::String(s) => Value::String(self.render(&s)?),
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|v| self.resolve_value(v))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| Ok((k, self.resolve_value(v)?)))
                    .collect::<Result<_, TemplateError>>()?,
            ),
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> TemplateVars {
        let mut v = TemplateVars::new();
        v.insert("agent_workspace", "/work/job1");
        v.insert("token.github", "ghp_global");
        v.insert("config.port", "8080");
        v
    }

    #[test]
    fn test_render_known_and_plain_text() {
        let v = vars();
        assert_eq!(v.render("${agent_workspace}/out").unwrap(), "/work/job1/out");
        assert_eq!(v.render("no placeholders").unwrap(), "no placeholders");
        assert_eq!(
            v.render("http://localhost:${config.port}/${token.github}").unwrap(),
            "http://localhost:8080/ghp_global"
        );
        assert_eq!(v.render("cost $5").unwrap(), "cost $5");
    }

    #[test]
    fn test_unresolved_left_literal_under_warn() {
        let v = vars();
        assert_eq!(v.render("key=${token.missing}!").unwrap(), "key=${token.missing}!");
        assert_eq!(v.render("open ${agent_workspace").unwrap(), "open ${agent_workspace");
        assert_eq!(v.render("${}").unwrap(), "${}");
    }

    #[test]
    fn test_unresolved_fails_under_deny() {
        let v = vars().with_policy(UnresolvedPolicy::Deny);
        assert_eq!(
            v.render("${token.missing}"),
            Err(TemplateError::Unresolved("token.missing".into()))
        );
    }

    #[test]
    fn test_resolve_nested_value() {
        let v = vars();
        let params = json!({
            "command": "node",
            "args": ["${agent_workspace}/server.js", "--port", "${config.port}"],
            "env": {"GITHUB_TOKEN": "${token.github}", "DEPTH": 3},
        });
        let out = v.resolve_value(params).unwrap();
        assert_eq!(out["args"][0], "/work/job1/server.js");
        assert_eq!(out["args"][2], "8080");
        assert_eq!(out["env"]["GITHUB_TOKEN"], "ghp_global");
        assert_eq!(out["env"]["DEPTH"], 3);
    }

    #[test]
    fn test_job_secrets_override_global() {
        let workspace = WorkspacePaths::new("/tmp/ws", "/tmp/root");
        let global = ScalarTable::from_pairs([("github", "global"), ("notion", "n1")]);
        let local = ScalarTable::from_pairs([("github", "local")]);
        let config = ScalarTable::from_pairs([("podman", "true")]);

        let v = TemplateVars::build(&workspace, Some("podman"), &config, &global, Some(&local));
        assert_eq!(v.get("token.github"), Some("local"));
        assert_eq!(v.get("token.notion"), Some("n1"));
        assert_eq!(v.get("config.podman"), Some("true"));
        assert_eq!(v.get("podman_or_docker"), Some("podman"));
        assert_eq!(v.get("local_servers_paths"), Some("/tmp/root/local_servers"));
    }
}
