use serde::{Deserialize, Serialize};

use crate::env::Env;
use crate::error::{Error, Result};
use crate::utils::template::TemplateVars;

/// A deploy target. Immutable once registered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    #[serde(skip_deserializing, default)]
    pub name: String,
    pub address: String,
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Opaque credential handle handed to ssh (`-i`). Key material is never
    /// read by rollout itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_ref: Option<String>,
    #[serde(default)]
    pub env: Env,
}

fn default_port() -> u16 {
    22
}

impl HostConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            user: user.into(),
            port: default_port(),
            identity_ref: None,
            env: Env::new(),
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.set(key, value);
        self
    }

    pub fn is_valid(&self) -> bool {
        !self.address.is_empty() && !self.user.is_empty()
    }

    /// Env seen by tasks on this host: global defaults, then the host's own
    /// entries, then invocation overrides. Later layers win.
    pub fn resolve_env(&self, defaults: &Env, overrides: &Env) -> Env {
        let mut base = Env::new();
        base.set(TemplateVars::HOST, &self.address);
        base.set(TemplateVars::USER, &self.user);
        base.merged_with(defaults)
            .merged_with(&self.env)
            .merged_with(overrides)
    }
}

/// Named host configurations, kept in registration order.
#[derive(Debug, Clone, Default)]
pub struct HostRegistry {
    hosts: Vec<HostConfig>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, host: HostConfig) -> Result<()> {
        if self.hosts.iter().any(|h| h.name == host.name) {
            return Err(Error::duplicate_host(host.name));
        }
        if !host.is_valid() {
            return Err(Error::config_invalid_value(
                format!("hosts.{}", host.name),
                None,
                "address and user are required",
            ));
        }
        self.hosts.push(host);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<&HostConfig> {
        self.hosts
            .iter()
            .find(|h| h.name == name)
            .ok_or_else(|| Error::unknown_host(name, self.names()))
    }

    /// Hosts targeted by an invocation. An empty selection means every host.
    pub fn select(&self, names: &[String]) -> Result<Vec<&HostConfig>> {
        if names.is_empty() {
            return Ok(self.hosts.iter().collect());
        }
        let mut selected: Vec<&HostConfig> = Vec::with_capacity(names.len());
        for name in names {
            let host = self.resolve(name)?;
            if !selected.iter().any(|h| h.name == host.name) {
                selected.push(host);
            }
        }
        Ok(selected)
    }

    pub fn names(&self) -> Vec<String> {
        self.hosts.iter().map(|h| h.name.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostConfig> {
        self.hosts.iter()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn azzryel() -> HostConfig {
        HostConfig::new("server", "azzryel.com", "root")
            .with_env("deploy_path", "/var/www/hram.azzryel.com")
            .with_env("branch", "master")
    }

    #[test]
    fn register_rejects_duplicate_names() {
        let mut registry = HostRegistry::new();
        registry.register(azzryel()).unwrap();
        let err = registry.register(azzryel()).unwrap_err();
        assert_eq!(err.code, ErrorCode::HostDuplicate);
    }

    #[test]
    fn register_rejects_hosts_without_user() {
        let mut registry = HostRegistry::new();
        let err = registry
            .register(HostConfig::new("bad", "example.com", ""))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalidValue);
    }

    #[test]
    fn resolve_unknown_host_lists_known_names() {
        let mut registry = HostRegistry::new();
        registry.register(azzryel()).unwrap();
        let err = registry.resolve("staging").unwrap_err();
        assert_eq!(err.code, ErrorCode::HostNotFound);
        assert_eq!(err.details["known"][0], "server");
    }

    #[test]
    fn select_empty_means_all_and_dedupes() {
        let mut registry = HostRegistry::new();
        registry.register(azzryel()).unwrap();
        registry
            .register(HostConfig::new("second", "b.example.com", "deploy"))
            .unwrap();

        assert_eq!(registry.select(&[]).unwrap().len(), 2);
        let picked = registry
            .select(&["second".to_string(), "second".to_string()])
            .unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].address, "b.example.com");
    }

    #[test]
    fn override_wins_over_host_and_defaults() {
        let host = azzryel();
        let defaults: Env = [("branch", "develop"), ("keep_releases", "5")]
            .into_iter()
            .collect();
        let overrides: Env = [("branch", "prod"), ("ticket", "OPS-12")].into_iter().collect();

        let env = host.resolve_env(&defaults, &overrides);
        assert_eq!(env.get("branch"), Some("prod"));
        assert_eq!(env.get("keep_releases"), Some("5"));
        assert_eq!(env.get("ticket"), Some("OPS-12"));
        assert_eq!(env.get("host"), Some("azzryel.com"));
        assert_eq!(env.get("deploy_path"), Some("/var/www/hram.azzryel.com"));
    }
}
