//! Registry: the in-memory map from configuration name to [`ConfigEntry`],
//! hot-reloadable from a JSON file and atomically swapped on every
//! rebuild.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::GlobalConfig;

/// One managed configuration file and its binding to a service or script.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConfigEntry {
    /// The registry key this entry was registered under.
    pub name: String,
    /// Absolute path of the managed file.
    pub path: Utf8PathBuf,
    /// Service binding: a bare unit name, `"systemctl"`, a `bash:`/`sh:`/`perl:`/`exec:` runner, or the postmulti opaque form.
    pub service: String,
    /// Free-form grouping label, defaults to `"uncategorized"`.
    pub category: String,
    /// Ordered action token -> fixed extra argument list.
    pub actions: BTreeMap<String, Vec<String>>,
    /// Optional ownership override.
    pub user: Option<String>,
    /// Optional group override.
    pub group: Option<String>,
    /// Optional mode override, as an octal string (3 or 4 digits).
    pub mode: Option<String>,
    /// Per-entry override of the global `apply_meta` flag.
    pub apply_meta: Option<bool>,
    /// `backupRoot + "/" + sanitize(name)`, computed once at registration time.
    pub backup_dir: Utf8PathBuf,
}

/// Replace every character outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Names must not contain `/`, `\`, or `..`.
pub fn is_traversal_shaped(name: &str) -> bool {
    name.contains('/') || name.contains('\\') || name.contains("..")
}

#[derive(Debug, Deserialize)]
struct ConfigEntryRaw {
    path: String,
    service: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    actions: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default)]
    commands: Option<Value>,
    #[serde(default)]
    command_args: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    apply_meta: Option<bool>,
}

/// Apply the schema precedence order: `actions` map, then
/// `commands` map, then `command_args` (+ optional `commands` ordering
/// list), then a bare `commands` list containing the literal `run`.
fn derive_actions(raw: &ConfigEntryRaw) -> BTreeMap<String, Vec<String>> {
    if let Some(actions) = &raw.actions {
        return actions.clone();
    }
    match &raw.commands {
        Some(Value::Object(map)) => {
            return map
                .iter()
                .filter_map(|(k, v)| {
                    let args = v
                        .as_array()?
                        .iter()
                        .filter_map(|a| a.as_str().map(String::from))
                        .collect();
                    Some((k.clone(), args))
                })
                .collect();
        }
        _ => {}
    }
    if let Some(command_args) = &raw.command_args {
        if let Some(Value::Array(order)) = &raw.commands {
            let order: Vec<String> = order
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect();
            let mut out = BTreeMap::new();
            for token in order {
                if let Some(args) = command_args.get(&token) {
                    out.insert(token, args.clone());
                }
            }
            // Tokens present in command_args but not named in the order list
            // are still registered, following command_args as the source of truth.
            for (token, args) in command_args {
                out.entry(token.clone()).or_insert_with(|| args.clone());
            }
            return out;
        }
        return command_args.clone();
    }
    if let Some(Value::Array(list)) = &raw.commands {
        let has_run = list.iter().any(|v| v.as_str() == Some("run"));
        if has_run {
            let mut out = BTreeMap::new();
            out.insert("run".to_string(), Vec::new());
            return out;
        }
    }
    BTreeMap::new()
}

impl ConfigEntry {
    fn from_raw(name: &str, raw: ConfigEntryRaw, backup_root: &Utf8PathBuf) -> Self {
        let backup_dir = backup_root.join(sanitize(name));
        ConfigEntry {
            name: name.to_string(),
            path: Utf8PathBuf::from(raw.path),
            service: raw.service,
            category: raw.category.unwrap_or_else(|| "uncategorized".to_string()),
            actions: derive_actions(&raw),
            user: raw.user,
            group: raw.group,
            mode: raw.mode,
            apply_meta: raw.apply_meta,
            backup_dir,
        }
    }
}

/// Process-wide registry, a pointer-swapped snapshot: readers take a
/// cheap `Arc` clone of the current map and are unaffected by concurrent
/// writers publishing a new one.
#[derive(Debug, Clone)]
pub struct Registry {
    inner: Arc<RwLock<Arc<BTreeMap<String, ConfigEntry>>>>,
}

impl Registry {
    /// Build a registry from `configs.json` bytes, skipping entries whose
    /// name is traversal-shaped. Does not touch disk.
    pub fn parse(bytes: &[u8], backup_root: &Utf8PathBuf) -> anyhow::Result<BTreeMap<String, ConfigEntry>> {
        let raw_map: BTreeMap<String, ConfigEntryRaw> = serde_json::from_slice(bytes)
            .map_err(|e| anyhow::anyhow!("invalid configs.json: {e}"))?;
        let mut out = BTreeMap::new();
        for (name, raw) in raw_map {
            if is_traversal_shaped(&name) {
                warn!(name, "Registry: skipping entry with traversal-shaped name");
                continue;
            }
            out.insert(name.clone(), ConfigEntry::from_raw(&name, raw, backup_root));
        }
        Ok(out)
    }

    /// Construct a registry already populated with `table`.
    pub fn new(table: BTreeMap<String, ConfigEntry>) -> Self {
        Registry {
            inner: Arc::new(RwLock::new(Arc::new(table))),
        }
    }

    /// Take a consistent snapshot of the current map. Concurrent writers
    /// publishing a new snapshot never leave a reader holding a half-updated
    /// map, because the swap below replaces the whole `Arc` in one write.
    pub async fn snapshot(&self) -> Arc<BTreeMap<String, ConfigEntry>> {
        self.inner.read().await.clone()
    }

    /// Atomically replace the registry contents.
    pub async fn rebuild(&self, table: BTreeMap<String, ConfigEntry>) {
        let mut guard = self.inner.write().await;
        *guard = Arc::new(table);
        info!(count = guard.len(), "Registry: rebuilt");
    }

    /// Look up one entry by name.
    pub async fn get(&self, name: &str) -> Option<ConfigEntry> {
        self.snapshot().await.get(name).cloned()
    }

    /// Remove one entry by name; returns whether it was present.
    pub async fn remove(&self, name: &str) -> bool {
        let mut guard = self.inner.write().await;
        let mut table = (**guard).clone();
        let removed = table.remove(name).is_some();
        *guard = Arc::new(table);
        removed
    }

    /// Reload from `configs.json` on disk, replacing the in-memory map.
    /// Disk is the source of truth for a plain reload.
    pub async fn reload_from_disk(&self, configs_path: &std::path::Path, backup_root: &Utf8PathBuf) -> anyhow::Result<()> {
        let bytes = std::fs::read(configs_path)
            .map_err(|e| anyhow::anyhow!("reading {}: {e}", configs_path.display()))?;
        let table = Self::parse(&bytes, backup_root)?;
        self.rebuild(table).await;
        Ok(())
    }
}

/// Convenience bundle so handlers only need one piece of shared state to
/// reach [`GlobalConfig`] and the registry's JSON persistence path.
#[derive(Debug, Clone)]
pub struct RegistryPaths {
    /// Path of `configs.json` on disk, re-persisted after a successful
    /// `POST /raw/configs` rewrite.
    pub configs_path: Utf8PathBuf,
    /// Effective backup root, used when deriving new entries' `backup_dir`.
    pub backup_root: Utf8PathBuf,
}

impl RegistryPaths {
    /// Bind a path bundle to a given `GlobalConfig`.
    pub fn from_global(cfg: &GlobalConfig, configs_path: Utf8PathBuf) -> Self {
        RegistryPaths {
            configs_path,
            backup_root: cfg.backup_root.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> Utf8PathBuf {
        Utf8PathBuf::from("/var/lib/configd/backups")
    }

    #[test]
    fn sanitize_replaces_unsafe_chars() {
        assert_eq!(sanitize("my service!"), "my_service_");
        assert_eq!(sanitize("nginx-main.conf"), "nginx-main.conf");
    }

    #[test]
    fn rejects_traversal_shaped_names() {
        assert!(is_traversal_shaped("../etc"));
        assert!(is_traversal_shaped("a/b"));
        assert!(is_traversal_shaped("a\\b"));
        assert!(!is_traversal_shaped("nginx"));
    }

    #[test]
    fn actions_schema_precedence_a_actions_wins() {
        let json = r#"{
            "path": "/etc/nginx/nginx.conf",
            "service": "nginx",
            "actions": {"reload": []},
            "commands": {"restart": []}
        }"#;
        let raw: ConfigEntryRaw = serde_json::from_str(json).unwrap();
        let acts = derive_actions(&raw);
        assert_eq!(acts.len(), 1);
        assert!(acts.contains_key("reload"));
    }

    #[test]
    fn actions_schema_commands_map() {
        let json = r#"{
            "path": "/etc/nginx/nginx.conf",
            "service": "nginx",
            "commands": {"restart": ["--now"]}
        }"#;
        let raw: ConfigEntryRaw = serde_json::from_str(json).unwrap();
        let acts = derive_actions(&raw);
        assert_eq!(acts.get("restart"), Some(&vec!["--now".to_string()]));
    }

    #[test]
    fn actions_schema_command_args_with_order() {
        let json = r#"{
            "path": "/etc/nginx/nginx.conf",
            "service": "nginx",
            "commands": ["restart", "reload"],
            "command_args": {"reload": [], "restart": ["-f"]}
        }"#;
        let raw: ConfigEntryRaw = serde_json::from_str(json).unwrap();
        let acts = derive_actions(&raw);
        assert_eq!(acts.get("restart"), Some(&vec!["-f".to_string()]));
        assert!(acts.contains_key("reload"));
    }

    #[test]
    fn actions_schema_commands_list_run() {
        let json = r#"{
            "path": "/etc/nginx/nginx.conf",
            "service": "exec:/opt/run.sh",
            "commands": ["run"]
        }"#;
        let raw: ConfigEntryRaw = serde_json::from_str(json).unwrap();
        let acts = derive_actions(&raw);
        assert_eq!(acts.get("run"), Some(&vec![]));
    }

    #[test]
    fn parse_skips_bad_names_keeps_good_ones() {
        let json = r#"{
            "../etc": {"path": "/etc/passwd", "service": "systemctl"},
            "nginx": {"path": "/etc/nginx/nginx.conf", "service": "nginx", "actions": {"reload": []}}
        }"#;
        let table = Registry::parse(json.as_bytes(), &root()).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.contains_key("nginx"));
    }

    #[tokio::test]
    async fn rebuild_swap_is_atomic_snapshot() {
        let reg = Registry::new(BTreeMap::new());
        let mut table = BTreeMap::new();
        table.insert(
            "a".to_string(),
            ConfigEntry::from_raw(
                "a",
                ConfigEntryRaw {
                    path: "/etc/a.conf".into(),
                    service: "a".into(),
                    category: None,
                    actions: None,
                    commands: None,
                    command_args: None,
                    user: None,
                    group: None,
                    mode: None,
                    apply_meta: None,
                },
                &root(),
            ),
        );
        reg.rebuild(table).await;
        let snap = reg.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert!(reg.get("a").await.is_some());
        assert!(reg.get("missing").await.is_none());
    }
}
