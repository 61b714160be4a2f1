//! Host inventory file
//!
//! ```json
//! {
//!   "targets": [
//!     { "name": "db1", "host": "10.0.0.5", "username": "ops", "auth": "key",
//!       "key_path": "~/.ssh/id_ed25519" }
//!   ],
//!   "groups": { "web": ["web1", "web2"] }
//! }
//! ```
//!
//! `~` in key paths is expanded on lookup; the file keeps what the user wrote.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sshmux_core::Target;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
}

impl Inventory {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read inventory {}", path.display()))?;
        let inventory: Inventory = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid inventory {}", path.display()))?;
        inventory.validate()?;
        Ok(inventory)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw).with_context(|| format!("Failed to write inventory {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for target in &self.targets {
            if target.name.is_empty() || target.host.is_empty() {
                bail!("Inventory target with empty name or host");
            }
            if !seen.insert(target.name.as_str()) {
                bail!("Duplicate target name '{}'", target.name);
            }
        }
        for (group, members) in &self.groups {
            for member in members {
                if !seen.contains(member.as_str()) {
                    bail!("Group '{}' references unknown target '{}'", group, member);
                }
            }
        }
        Ok(())
    }

    /// Connectable copy of `name`, with its key path expanded
    pub fn target(&self, name: &str) -> Result<Target> {
        self.targets
            .iter()
            .find(|t| t.name == name)
            .map(expanded)
            .with_context(|| format!("Unknown target '{}'", name))
    }

    /// The stored entry, as written in the file
    pub fn target_mut(&mut self, name: &str) -> Result<&mut Target> {
        self.targets
            .iter_mut()
            .find(|t| t.name == name)
            .with_context(|| format!("Unknown target '{}'", name))
    }

    /// Members of `group` in inventory order
    pub fn group(&self, name: &str) -> Result<Vec<Target>> {
        let members = self
            .groups
            .get(name)
            .with_context(|| format!("Unknown group '{}'", name))?;
        members.iter().map(|m| self.target(m)).collect()
    }
}

fn expanded(target: &Target) -> Target {
    let mut target = target.clone();
    target.key_path = target.key_path.as_deref().map(expand_home);
    target
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// `~/.config/sshmux/hosts.json`
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("sshmux").join("hosts.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sshmux_core::AuthKind;

    const SAMPLE: &str = r#"{
        "targets": [
            { "name": "db1", "host": "10.0.0.5", "username": "ops", "auth": "key", "key_path": "/keys/id" },
            { "name": "web1", "host": "10.0.1.1", "port": 2222, "username": "ops", "auth": "password",
              "credential_ref": "password-web1" },
            { "name": "web2", "host": "10.0.1.2", "username": "ops", "auth": "agent" }
        ],
        "groups": { "web": ["web1", "web2"] }
    }"#;

    fn write(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.json");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_targets_and_groups() {
        let (_dir, path) = write(SAMPLE);
        let inventory = Inventory::load(&path).unwrap();

        let db1 = inventory.target("db1").unwrap();
        assert_eq!(db1.auth_kind, AuthKind::Key);
        assert_eq!(db1.port, 22);

        let web = inventory.group("web").unwrap();
        assert_eq!(web.len(), 2);
        assert_eq!(web[0].port, 2222);
        assert!(web[0].is_store_backed());
        assert!(inventory.group("nope").is_err());
    }

    #[test]
    fn test_unknown_group_member_rejected() {
        let (_dir, path) = write(
            r#"{ "targets": [], "groups": { "web": ["ghost"] } }"#,
        );
        let err = Inventory::load(&path).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let (_dir, path) = write(
            r#"{ "targets": [
                { "name": "a", "host": "h1", "username": "u", "auth": "agent" },
                { "name": "a", "host": "h2", "username": "u", "auth": "agent" }
            ] }"#,
        );
        assert!(Inventory::load(&path).is_err());
    }

    #[test]
    fn test_save_round_trip_keeps_reference() {
        let (_dir, path) = write(SAMPLE);
        let mut inventory = Inventory::load(&path).unwrap();
        inventory.target_mut("web2").unwrap().credential_ref = Some("password-web2".to_string());
        inventory.save(&path).unwrap();

        let reloaded = Inventory::load(&path).unwrap();
        assert_eq!(
            reloaded.target("web2").unwrap().credential_ref.as_deref(),
            Some("password-web2")
        );
    }

    #[test]
    fn test_tilde_expanded_on_lookup_only() {
        let (_dir, path) = write(
            r#"{ "targets": [
                { "name": "db1", "host": "h1", "username": "u", "auth": "key", "key_path": "~/.ssh/id_ed25519" },
                { "name": "web1", "host": "h2", "username": "u", "auth": "password" }
            ] }"#,
        );
        let mut inventory = Inventory::load(&path).unwrap();

        let db1 = inventory.target("db1").unwrap();
        let key = db1.key_path.unwrap();
        if let Some(home) = dirs::home_dir() {
            assert_eq!(key, home.join(".ssh/id_ed25519"));
        }

        inventory.target_mut("web1").unwrap().credential_ref = Some("password-web1".to_string());
        inventory.save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("~/.ssh/id_ed25519"));
        let reloaded = Inventory::load(&path).unwrap();
        assert_eq!(
            reloaded.targets[0].key_path.as_deref(),
            Some(Path::new("~/.ssh/id_ed25519"))
        );
    }
}
