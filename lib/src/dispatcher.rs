//! ActionDispatcher: route an action token to the right execution
//! strategy, enforce argument syntax, and append settle-time and status
//! verification where the target needs it.

use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::GlobalConfig;
use crate::error::{AppError, AppResult};
use crate::executor::{capture, run_rc, CaptureResult};
use crate::registry::ConfigEntry;

const SYSTEMCTL_TIMEOUT: f64 = 30.0;
const SCRIPT_TIMEOUT: f64 = 30.0;
const VERIFY_TIMEOUT: f64 = 10.0;
const POSTMULTI_SETTLE_SECS: f64 = 0.6;

const FORBIDDEN_SUBCOMMANDS: [&str; 3] = ["poweroff", "reboot", "halt"];

fn arg_pattern() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._:+@/=\-,]+$").expect("valid regex"))
}

fn runner_pattern() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(bash|sh|perl|exec):(/.+)$").expect("valid regex"))
}

fn validate_args(args: &[String]) -> AppResult<()> {
    for a in args {
        if !arg_pattern().is_match(a) {
            return Err(AppError::ActionPolicy(format!(
                "Aktion nicht erlaubt: argument {a:?} fails syntax check"
            )));
        }
    }
    Ok(())
}

/// Entry point: resolve the action token against `entry`'s table, select a
/// strategy by `entry.service`, run it, and return the JSON action response.
pub async fn dispatch(cfg: &GlobalConfig, entry: &ConfigEntry, action: &str) -> AppResult<Value> {
    let extras = entry
        .actions
        .get(action)
        .ok_or_else(|| AppError::ActionPolicy(format!("Aktion nicht erlaubt: unknown action {action:?}")))?
        .clone();
    validate_args(&extras)?;

    if entry.service == "exec:/usr/sbin/postmulti" {
        return postmulti_strategy(entry, action, &extras).await;
    }
    if action == "daemon-reload" {
        return systemctl_direct(cfg, "daemon-reload", &extras).await;
    }
    if let Some(caps) = runner_pattern().captures(&entry.service) {
        return script_runner_strategy(cfg, &caps[1], &caps[2], action, &extras).await;
    }
    if entry.service == "systemctl" {
        if FORBIDDEN_SUBCOMMANDS.contains(&action) {
            return Err(AppError::ActionPolicy(format!(
                "Aktion nicht erlaubt: {action} is forbidden"
            )));
        }
        return systemctl_direct(cfg, action, &extras).await;
    }
    unit_control_strategy(cfg, &entry.service, action, &extras).await
}

async fn systemctl_argv(cfg: &GlobalConfig, sub: &str, extra: &[String]) -> Vec<String> {
    let mut argv = cfg.systemctl_flags.clone();
    argv.push(sub.to_string());
    argv.extend_from_slice(extra);
    argv
}

async fn systemctl_rc(cfg: &GlobalConfig, sub: &str, extra: &[String], timeout: f64) -> i32 {
    let argv = systemctl_argv(cfg, sub, extra).await;
    run_rc(timeout, cfg.systemctl_bin.as_str(), &argv).await
}

async fn systemctl_direct(cfg: &GlobalConfig, sub: &str, extra: &[String]) -> AppResult<Value> {
    let rc = systemctl_rc(cfg, sub, extra, SYSTEMCTL_TIMEOUT).await;
    Ok(json!({ "ok": rc == 0, "action": sub, "rc": rc }))
}

async fn is_active(cfg: &GlobalConfig, unit: &str) -> i32 {
    systemctl_rc(cfg, "is-active", &[unit.to_string()], VERIFY_TIMEOUT).await
}

async fn verified_response(cfg: &GlobalConfig, unit: &str, action: &str, rc: i32) -> Value {
    let verify_rc = is_active(cfg, unit).await;
    let running = verify_rc == 0;
    let status = if running { "running" } else { "stopped" };
    let ok = if action == "stop" { !running } else { running };
    json!({ "ok": ok, "action": action, "status": status, "rc": rc })
}

async fn unit_control_strategy(
    cfg: &GlobalConfig,
    unit: &str,
    action: &str,
    extras: &[String],
) -> AppResult<Value> {
    match action {
        "stop_start" => {
            let _ = systemctl_rc(cfg, "stop", &[unit.to_string()], SYSTEMCTL_TIMEOUT).await;
            let rc = systemctl_rc(cfg, "start", &[unit.to_string()], SYSTEMCTL_TIMEOUT).await;
            Ok(verified_response(cfg, unit, action, rc).await)
        }
        "restart" => {
            let rc = systemctl_rc(cfg, "restart", &[unit.to_string()], SYSTEMCTL_TIMEOUT).await;
            Ok(verified_response(cfg, unit, action, rc).await)
        }
        "reload" => {
            let active_rc = is_active(cfg, unit).await;
            if active_rc != 0 {
                return Err(AppError::Transient(format!(
                    "Schreibfehler: service not active (is-active rc={active_rc})"
                )));
            }
            let rc = systemctl_rc(cfg, "reload", &[unit.to_string()], SYSTEMCTL_TIMEOUT).await;
            Ok(verified_response(cfg, unit, action, rc).await)
        }
        "start" | "stop" => {
            let rc = systemctl_rc(cfg, action, &[unit.to_string()], SYSTEMCTL_TIMEOUT).await;
            Ok(verified_response(cfg, unit, action, rc).await)
        }
        other => {
            let mut argv_extra = vec![unit.to_string()];
            if extras.is_empty() {
                let rc = systemctl_rc(cfg, other, &argv_extra, SYSTEMCTL_TIMEOUT).await;
                Ok(json!({ "ok": rc == 0, "action": other, "rc": rc }))
            } else {
                argv_extra.extend_from_slice(extras);
                let rc = systemctl_rc(cfg, other, &argv_extra, SYSTEMCTL_TIMEOUT).await;
                Ok(json!({ "ok": rc == 0, "action": other, "rc": rc }))
            }
        }
    }
}

async fn script_runner_strategy(
    _cfg: &GlobalConfig,
    runner: &str,
    script: &str,
    action: &str,
    extras: &[String],
) -> AppResult<Value> {
    let (argv0, mut argv): (String, Vec<String>) = match runner {
        "bash" => ("/bin/bash".to_string(), vec![script.to_string()]),
        "sh" => ("/bin/sh".to_string(), vec![script.to_string()]),
        "perl" => ("/usr/bin/perl".to_string(), vec![script.to_string()]),
        "exec" => (script.to_string(), vec![]),
        _ => unreachable!("runner_pattern only matches bash|sh|perl|exec"),
    };
    if runner == "exec" && script.ends_with("/systemctl") {
        if let Some(first) = extras.first() {
            if FORBIDDEN_SUBCOMMANDS.contains(&first.as_str()) {
                return Err(AppError::ActionPolicy(format!(
                    "Aktion nicht erlaubt: {first} is forbidden"
                )));
            }
        }
    }
    argv.push(action.to_string());
    argv.extend_from_slice(extras);

    let CaptureResult { rc, out } = capture(SCRIPT_TIMEOUT, &argv0, &argv).await;

    if extras.first().map(String::as_str) == Some("is-active") {
        return Ok(json!({ "ok": true, "status": if rc == 0 { "running" } else { "stopped" } }));
    }
    Ok(json!({ "ok": rc == 0, "rc": rc, "output": out }))
}

fn parse_postmulti_status(output: &str, instance: &str) -> &'static str {
    let lower = output.to_lowercase();
    let instance_lower = instance.to_lowercase();

    let running_markers = [
        "is running".to_string(),
        format!("{instance_lower}: the postfix mail system is running"),
        format!("{instance_lower}: running"),
    ];
    if running_markers.iter().any(|m| lower.contains(m.as_str()))
        || Regex::new(r"pid:\s*\d+").unwrap().is_match(&lower)
    {
        return "running";
    }

    let stopped_markers = [
        "not running".to_string(),
        "inactive".to_string(),
        "stopped".to_string(),
        format!("{instance_lower}: not running"),
    ];
    if stopped_markers.iter().any(|m| lower.contains(m.as_str())) {
        return "stopped";
    }

    "unknown"
}

async fn postmulti_strategy(entry: &ConfigEntry, action: &str, extras: &[String]) -> AppResult<Value> {
    let bin = "/usr/sbin/postmulti";
    let CaptureResult { rc: primary_rc, out: primary_out } = capture(SCRIPT_TIMEOUT, bin, extras).await;

    if matches!(action, "stop" | "start" | "reload" | "restart") {
        tokio::time::sleep(std::time::Duration::from_secs_f64(POSTMULTI_SETTLE_SECS)).await;
    }

    let status_args: Vec<String> = entry
        .actions
        .get("status")
        .cloned()
        .unwrap_or_else(|| vec!["-i".into(), entry.name.clone(), "-p".into(), "status".into()]);
    let CaptureResult { out: status_out, .. } = capture(SCRIPT_TIMEOUT, bin, &status_args).await;

    let state = parse_postmulti_status(&status_out, &entry.name);
    let state = if state == "unknown" {
        match primary_rc {
            0 => "running",
            1 => "stopped",
            _ => "unknown",
        }
    } else {
        state
    };

    let ok = match action {
        "stop" => state == "stopped",
        "status" => true,
        _ => state == "running",
    };

    debug!(entry = entry.name, action, state, "Postmulti: status resolved");

    Ok(json!({
        "ok": ok,
        "action": action,
        "status": state,
        "state": state,
        "rc": primary_rc,
        "output": primary_out,
    }))
}

/// Exposed for callers needing to validate action tokens ahead of dispatch
/// (e.g. the router, to reject unknown tokens before touching a snapshot).
pub fn has_action(entry: &ConfigEntry, action: &str) -> bool {
    entry.actions.contains_key(action)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postmulti_parses_running() {
        let out = "postfix-apphost: the Postfix mail system is running";
        assert_eq!(parse_postmulti_status(out, "postfix-apphost"), "running");
    }

    #[test]
    fn postmulti_parses_not_running() {
        let out = "postfix-apphost: not running";
        assert_eq!(parse_postmulti_status(out, "postfix-apphost"), "stopped");
    }

    #[test]
    fn postmulti_parses_pid_marker() {
        let out = "master is listening, pid: 1234";
        assert_eq!(parse_postmulti_status(out, "x"), "running");
    }

    #[test]
    fn arg_validation_rejects_shell_metachars() {
        assert!(validate_args(&["safe-arg_1.2:3".into()]).is_ok());
        assert!(validate_args(&["bad;arg".into()]).is_err());
        assert!(validate_args(&["$(rm -rf /)".into()]).is_err());
    }

    #[tokio::test]
    async fn unknown_action_is_rejected() {
        let entry = ConfigEntry {
            name: "svcA".into(),
            path: "/etc/svcA.conf".into(),
            service: "svcA".into(),
            category: "uncategorized".into(),
            actions: Default::default(),
            user: None,
            group: None,
            mode: None,
            apply_meta: None,
            backup_dir: "/tmp".into(),
        };
        let cfg = test_cfg();
        let err = dispatch(&cfg, &entry, "restart").await.unwrap_err();
        assert!(matches!(err, AppError::ActionPolicy(_)));
    }

    fn test_cfg() -> GlobalConfig {
        GlobalConfig {
            listen: "x".into(),
            ssl_enable: false,
            ssl_cert_file: None,
            ssl_key_file: None,
            api_token: None,
            allowed_ips: vec![],
            allowed_roots: vec![],
            trusted_proxies: vec![],
            allow_origins: vec![],
            logfile: None,
            backup_root: "/tmp".into(),
            tmp_dir: "/tmp".into(),
            max_backups: 1,
            path_guard: crate::config::PathGuardMode::Off,
            apply_meta: false,
            auto_create_backups: false,
            systemctl_bin: "/bin/true".into(),
            systemctl_flags: vec![],
        }
    }
}
