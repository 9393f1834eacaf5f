//! Boot-time configuration: `global.json`.
//!
//! Loading the JSON itself is deliberately thin plumbing; what matters is
//! the typed, validated struct it produces.

use std::path::Path;

use camino::Utf8PathBuf;
use serde::Deserialize;

/// PathGuard operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathGuardMode {
    /// No containment checks at all.
    Off,
    /// Log mismatches but allow them through.
    Audit,
    /// Enforce containment; reject mismatches.
    On,
}

impl Default for PathGuardMode {
    fn default() -> Self {
        PathGuardMode::Audit
    }
}

/// One or more API tokens accepted by the pipeline. `global.json`'s
/// `secret` key may be a bare string or a list; `api_token` is the primary
/// key and always a string when present.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum SecretField {
    One(String),
    Many(Vec<String>),
}

/// The on-disk shape of `global.json`.
#[derive(Debug, Deserialize)]
struct GlobalConfigRaw {
    listen: String,
    #[serde(default)]
    ssl_enable: bool,
    ssl_cert_file: Option<String>,
    ssl_key_file: Option<String>,
    api_token: Option<String>,
    secret: Option<SecretField>,
    #[serde(default)]
    allowed_ips: Vec<String>,
    #[serde(default)]
    allowed_roots: Vec<String>,
    #[serde(default)]
    trusted_proxies: Vec<String>,
    #[serde(default)]
    allow_origins: Vec<String>,
    logfile: Option<String>,
    #[serde(rename = "backupDir")]
    backup_dir: String,
    #[serde(rename = "tmpDir")]
    tmp_dir: Option<String>,
    #[serde(rename = "maxBackups", default = "default_max_backups")]
    max_backups: usize,
    #[serde(default)]
    path_guard: PathGuardMode,
    #[serde(default)]
    apply_meta: bool,
    #[serde(default)]
    auto_create_backups: bool,
    #[serde(default = "default_systemctl")]
    systemctl: String,
    systemctl_flags: Option<String>,
}

fn default_max_backups() -> usize {
    10
}

fn default_systemctl() -> String {
    "/usr/bin/systemctl".to_string()
}

/// Process-wide, immutable-after-load configuration.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    /// `host:port` to bind the listener to.
    pub listen: String,
    /// Whether TLS termination should be configured (plumbing, out of core scope).
    pub ssl_enable: bool,
    /// Certificate file path, when `ssl_enable` is set.
    pub ssl_cert_file: Option<Utf8PathBuf>,
    /// Key file path, when `ssl_enable` is set.
    pub ssl_key_file: Option<Utf8PathBuf>,
    /// Bearer/`X-API-Token` value required on every request, if any.
    pub api_token: Option<String>,
    /// CIDR blocks permitted to call the API; empty means no IP admission check.
    pub allowed_ips: Vec<ipnetwork::IpNetwork>,
    /// Canonical allowed path roots for PathGuard.
    pub allowed_roots: Vec<Utf8PathBuf>,
    /// Addresses whose `X-Forwarded-For` is trusted.
    pub trusted_proxies: Vec<std::net::IpAddr>,
    /// Allow-listed CORS origins; empty means "echo the request's Origin".
    pub allow_origins: Vec<String>,
    /// Optional logfile path (the logging backend itself lives outside this struct).
    pub logfile: Option<Utf8PathBuf>,
    /// Root directory under which each entry's backup directory is created.
    pub backup_root: Utf8PathBuf,
    /// Scratch directory for the atomic writer's fallback path.
    pub tmp_dir: Utf8PathBuf,
    /// Maximum number of retained snapshots per entry.
    pub max_backups: usize,
    /// PathGuard operating mode.
    pub path_guard: PathGuardMode,
    /// Global default for whether MetaEnforcer runs after writes/restores.
    pub apply_meta: bool,
    /// Whether BackupStore may create a missing backup directory.
    pub auto_create_backups: bool,
    /// Path to the `systemctl` binary.
    pub systemctl_bin: Utf8PathBuf,
    /// Extra flags always passed to `systemctl` invocations.
    pub systemctl_flags: Vec<String>,
}

impl GlobalConfig {
    /// Parse `global.json` bytes into a validated [`GlobalConfig`], applying
    /// the `API_TOKEN`, `PATH_GUARD`, and `SYSTEMCTL_FLAGS` environment
    /// overrides.
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let raw: GlobalConfigRaw = serde_json::from_slice(bytes)
            .map_err(|e| anyhow::anyhow!("invalid global.json: {e}"))?;
        Self::from_raw(raw)
    }

    /// Load and parse `<dir>/global.json`.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join("global.json");
        let bytes = std::fs::read(&path)
            .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
        Self::from_bytes(&bytes)
    }

    fn from_raw(raw: GlobalConfigRaw) -> anyhow::Result<Self> {
        let allowed_ips = raw
            .allowed_ips
            .iter()
            .map(|s| {
                s.parse::<ipnetwork::IpNetwork>()
                    .map_err(|e| anyhow::anyhow!("invalid CIDR {s:?}: {e}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        let trusted_proxies = raw
            .trusted_proxies
            .iter()
            .map(|s| {
                s.parse::<std::net::IpAddr>()
                    .map_err(|e| anyhow::anyhow!("invalid trusted proxy {s:?}: {e}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut api_token = match raw.secret {
            Some(SecretField::One(s)) => Some(s),
            Some(SecretField::Many(v)) => v.into_iter().next(),
            None => None,
        };
        if let Some(t) = raw.api_token {
            api_token = Some(t);
        }
        if let Ok(env_token) = std::env::var("API_TOKEN") {
            if !env_token.is_empty() {
                api_token = Some(env_token);
            }
        }

        let path_guard = match std::env::var("PATH_GUARD") {
            Ok(v) => match v.to_lowercase().as_str() {
                "off" => PathGuardMode::Off,
                "audit" => PathGuardMode::Audit,
                "on" => PathGuardMode::On,
                _ => raw.path_guard,
            },
            Err(_) => raw.path_guard,
        };

        let mut systemctl_flags: Vec<String> = raw
            .systemctl_flags
            .unwrap_or_default()
            .split_whitespace()
            .map(String::from)
            .collect();
        if let Ok(env_flags) = std::env::var("SYSTEMCTL_FLAGS") {
            systemctl_flags = env_flags.split_whitespace().map(String::from).collect();
        }

        Ok(GlobalConfig {
            listen: raw.listen,
            ssl_enable: raw.ssl_enable,
            ssl_cert_file: raw.ssl_cert_file.map(Utf8PathBuf::from),
            ssl_key_file: raw.ssl_key_file.map(Utf8PathBuf::from),
            api_token,
            allowed_ips,
            allowed_roots: raw.allowed_roots.into_iter().map(Utf8PathBuf::from).collect(),
            trusted_proxies,
            allow_origins: raw.allow_origins,
            logfile: raw.logfile.map(Utf8PathBuf::from),
            backup_root: Utf8PathBuf::from(raw.backup_dir),
            tmp_dir: Utf8PathBuf::from(raw.tmp_dir.unwrap_or_else(|| "/tmp".to_string())),
            max_backups: raw.max_backups,
            path_guard,
            apply_meta: raw.apply_meta,
            auto_create_backups: raw.auto_create_backups,
            systemctl_bin: Utf8PathBuf::from(raw.systemctl),
            systemctl_flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_global_config() {
        let json = r#"{
            "listen": "127.0.0.1:8443",
            "backupDir": "/var/lib/configd/backups"
        }"#;
        let cfg = GlobalConfig::from_bytes(json.as_bytes()).unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:8443");
        assert_eq!(cfg.max_backups, 10);
        assert_eq!(cfg.path_guard, PathGuardMode::Audit);
        assert!(cfg.allowed_ips.is_empty());
    }

    #[test]
    #[serial_test::serial(configd_env)]
    fn env_overrides_api_token_and_path_guard() {
        std::env::set_var("API_TOKEN", "from-env");
        std::env::set_var("PATH_GUARD", "on");
        let json = r#"{"listen":"0.0.0.0:9000","backupDir":"/tmp/b","api_token":"from-file","path_guard":"off"}"#;
        let cfg = GlobalConfig::from_bytes(json.as_bytes()).unwrap();
        assert_eq!(cfg.api_token.as_deref(), Some("from-env"));
        assert_eq!(cfg.path_guard, PathGuardMode::On);
        std::env::remove_var("API_TOKEN");
        std::env::remove_var("PATH_GUARD");
    }

    #[test]
    fn secret_list_picks_first() {
        let json = r#"{"listen":"0.0.0.0:9000","backupDir":"/tmp/b","secret":["first","second"]}"#;
        let cfg = GlobalConfig::from_bytes(json.as_bytes()).unwrap();
        assert_eq!(cfg.api_token.as_deref(), Some("first"));
    }
}
