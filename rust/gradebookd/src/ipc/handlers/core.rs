use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use log::{info, warn};
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "autosaveSessions": state.sessions.len(),
            "thresholdEditorOpen": state.thresholds.is_some(),
            "queuedNotices": state.notices.len(),
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    let conn = match db::open_db(&path) {
        Ok(conn) => conn,
        Err(e) => {
            // The previous workspace and its editors stay mounted.
            warn!("event=workspace_open status=error error={e:?}");
            return err(&req.id, "db_open_failed", format!("{e:?}"), None);
        }
    };

    // Editors bound to the previous workspace are unmounted before the switch.
    state.teardown();
    info!(
        "event=workspace_open status=ok path={}",
        path.to_string_lossy()
    );
    state.workspace = Some(path.clone());
    state.db = Some(conn);
    ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autosave::AutoPersist;
    use crate::config::DaemonConfig;
    use crate::store::Collection;
    use std::time::Instant;

    fn select(state: &mut AppState, path: &std::path::Path) -> serde_json::Value {
        let req = Request {
            id: "ws".to_string(),
            method: "workspace.select".to_string(),
            params: json!({ "path": path.to_string_lossy() }),
        };
        handle_workspace_select(state, &req)
    }

    #[test]
    fn failed_select_keeps_previous_workspace_and_pending_edits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = dir.path().join("first");
        let mut state = AppState::new(DaemonConfig::default());
        assert_eq!(select(&mut state, &first)["ok"], json!(true));

        let now = Instant::now();
        let mut persist = AutoPersist::new(Collection::Schools, "id");
        persist.observe(Some(&json!({ "id": "s1", "name": "A" })), now);
        persist.observe(Some(&json!({ "id": "s1", "name": "B" })), now);
        state.sessions.insert("school".to_string(), persist);

        // A workspace path below a regular file cannot be created.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").expect("write blocker");
        let resp = select(&mut state, &blocker.join("nested"));
        assert_eq!(resp["ok"], json!(false));
        assert_eq!(resp["error"]["code"], json!("db_open_failed"));

        assert_eq!(state.workspace.as_deref(), Some(first.as_path()));
        assert!(state.db.is_some());
        assert!(state.sessions["school"].status(now).pending);

        let second = dir.path().join("second");
        assert_eq!(select(&mut state, &second)["ok"], json!(true));
        assert!(state.sessions.is_empty());
        assert_eq!(state.workspace.as_deref(), Some(second.as_path()));
    }
}
