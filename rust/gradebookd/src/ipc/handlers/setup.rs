use crate::config::{DaemonConfig, MAX_AUTOSAVE_DELAY_MS, MIN_AUTOSAVE_DELAY_MS};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::thresholds::{DEFAULT_TOTAL_MARKS, MAX_TOTAL_MARKS, MIN_TOTAL_MARKS};
use log::warn;
use serde_json::{json, Map, Value};
use std::time::Duration;

#[derive(Clone, Copy)]
enum SetupSection {
    Autosave,
    Grading,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "autosave" => Some(Self::Autosave),
            "grading" => Some(Self::Grading),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Autosave => "setup.autosave",
            Self::Grading => "setup.grading",
        }
    }
}

fn default_section(section: SetupSection, cfg: &DaemonConfig) -> Value {
    match section {
        SetupSection::Autosave => json!({
            "delayMs": cfg.autosave_delay.as_millis() as u64,
            "notifyOnSuccess": false
        }),
        SetupSection::Grading => json!({
            "defaultTotalMarks": DEFAULT_TOTAL_MARKS,
            "warnOnCoverageIssues": true
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v.as_i64().ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_f64_range(v: &Value, key: &str, min: f64, max: f64) -> Result<f64, String> {
    let n = v.as_f64().ok_or_else(|| format!("{} must be a number", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Autosave => match k.as_str() {
                "delayMs" => {
                    let n = parse_i64_range(
                        v,
                        k,
                        MIN_AUTOSAVE_DELAY_MS as i64,
                        MAX_AUTOSAVE_DELAY_MS as i64,
                    )?;
                    obj.insert(k.clone(), Value::from(n));
                }
                "notifyOnSuccess" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown autosave field: {}", k)),
            },
            SetupSection::Grading => match k.as_str() {
                "defaultTotalMarks" => {
                    let n = parse_f64_range(v, k, MIN_TOTAL_MARKS, MAX_TOTAL_MARKS)?;
                    obj.insert(k.clone(), Value::from(n));
                }
                "warnOnCoverageIssues" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(
    conn: &rusqlite::Connection,
    section: SetupSection,
    cfg: &DaemonConfig,
) -> anyhow::Result<Value> {
    let mut current = default_section(section, cfg);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Applied key by key. A malformed historical value keeps its default.
            for (k, v) in saved_obj {
                let mut single = Map::new();
                single.insert(k.clone(), v.clone());
                if let Err(msg) = merge_section_patch(section, &mut current, &single) {
                    warn!(
                        "event=setup_load status=skipped section={} error={}",
                        section.key(),
                        msg
                    );
                }
            }
        }
    }
    Ok(current)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutosaveSetup {
    pub delay: Duration,
    pub notify_on_success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradingSetup {
    pub default_total_marks: f64,
    pub warn_on_coverage_issues: bool,
}

pub fn autosave_setup(
    conn: &rusqlite::Connection,
    cfg: &DaemonConfig,
) -> anyhow::Result<AutosaveSetup> {
    let v = load_section(conn, SetupSection::Autosave, cfg)?;
    Ok(AutosaveSetup {
        delay: v
            .get("delayMs")
            .and_then(|d| d.as_u64())
            .map(Duration::from_millis)
            .unwrap_or(cfg.autosave_delay),
        notify_on_success: v
            .get("notifyOnSuccess")
            .and_then(|b| b.as_bool())
            .unwrap_or(false),
    })
}

pub fn grading_setup(
    conn: &rusqlite::Connection,
    cfg: &DaemonConfig,
) -> anyhow::Result<GradingSetup> {
    let v = load_section(conn, SetupSection::Grading, cfg)?;
    Ok(GradingSetup {
        default_total_marks: v
            .get("defaultTotalMarks")
            .and_then(|n| n.as_f64())
            .unwrap_or(DEFAULT_TOTAL_MARKS),
        warn_on_coverage_issues: v
            .get("warnOnCoverageIssues")
            .and_then(|b| b.as_bool())
            .unwrap_or(true),
    })
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let autosave = match load_section(conn, SetupSection::Autosave, &state.config) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let grading = match load_section(conn, SetupSection::Grading, &state.config) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "autosave": autosave,
            "grading": grading
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section, &state.config) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
