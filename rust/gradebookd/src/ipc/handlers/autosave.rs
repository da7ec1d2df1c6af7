use std::time::{Duration, Instant};

use crate::autosave::{AutoPersist, CommitOutcome, Observation};
use crate::config::MAX_AUTOSAVE_DELAY_MS;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    get_collection, get_optional_bool, get_optional_str, get_optional_u64_range,
    get_required_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::store::SqliteStore;
use log::{info, warn};
use serde_json::{json, Value};

use super::setup::autosave_setup;

pub fn observation_json(obs: Observation, now: Instant) -> Value {
    match obs {
        Observation::Disabled => json!({ "state": "disabled" }),
        Observation::Empty => json!({ "state": "empty" }),
        Observation::Unserializable => json!({ "state": "unserializable" }),
        Observation::Seeded => json!({ "state": "seeded" }),
        Observation::Unchanged => json!({ "state": "unchanged" }),
        Observation::Scheduled { deadline } => json!({
            "state": "scheduled",
            "dueInMs": deadline.saturating_duration_since(now).as_millis() as u64
        }),
    }
}

pub fn outcome_json(outcome: Option<CommitOutcome>) -> Value {
    match outcome {
        None => json!({ "saved": false, "reason": "nothing_to_save" }),
        Some(CommitOutcome::Upserted(summary)) => json!({
            "saved": true,
            "inserted": summary.inserted,
            "updated": summary.updated
        }),
        Some(CommitOutcome::Updated { rows }) => json!({ "saved": true, "updated": rows }),
        Some(CommitOutcome::Inserted { key }) => json!({ "saved": true, "key": key }),
        Some(CommitOutcome::Failed { message }) => json!({ "saved": false, "error": message }),
    }
}

fn snapshot_param(params: &Value) -> Option<&Value> {
    params.get("snapshot").filter(|v| !v.is_null())
}

fn observe(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let Some(conn) = state.db.as_ref() else {
        return Err(HandlerErr::no_workspace());
    };
    let session = get_required_str(params, "session")?;
    let collection = get_collection(params)?;
    let key_field = get_optional_str(params, "keyField")?
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "id".to_string());
    let delay_ms = get_optional_u64_range(params, "delayMs", 0, MAX_AUTOSAVE_DELAY_MS)?;
    let enabled = get_optional_bool(params, "enabled")?.unwrap_or(true);

    if let Some(existing) = state.sessions.get(&session) {
        if existing.collection() != collection || existing.key_field() != key_field {
            return Err(HandlerErr {
                code: "bad_params",
                message: format!("session {} is bound to another collection", session),
                details: Some(json!({
                    "collection": existing.collection(),
                    "keyField": existing.key_field()
                })),
            });
        }
    } else {
        let setup = autosave_setup(conn, &state.config).map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
        let persist = AutoPersist::new(collection, key_field.clone())
            .with_delay(setup.delay)
            .with_success_notices(setup.notify_on_success);
        info!(
            "event=autosave_session_open session={} collection={} key_field={}",
            session, collection, key_field
        );
        state.sessions.insert(session.clone(), persist);
    }

    let now = Instant::now();
    let Some(persist) = state.sessions.get_mut(&session) else {
        return Err(HandlerErr::bad_params("unknown session"));
    };
    if let Some(ms) = delay_ms {
        persist.set_delay(Duration::from_millis(ms));
    }
    persist.set_enabled(enabled);
    let obs = persist.observe(snapshot_param(params), now);
    Ok(observation_json(obs, now))
}

fn save_now(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let Some(conn) = state.db.as_ref() else {
        return Err(HandlerErr::no_workspace());
    };
    let session = get_required_str(params, "session")?;
    let Some(persist) = state.sessions.get_mut(&session) else {
        return Err(HandlerErr {
            code: "not_found",
            message: format!("unknown autosave session: {}", session),
            details: None,
        });
    };
    let mut store = SqliteStore::new(conn);
    let outcome = persist.save_now(snapshot_param(params), &mut store, &mut state.notices);
    Ok(outcome_json(outcome))
}

fn status(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = get_required_str(params, "session")?;
    let Some(persist) = state.sessions.get(&session) else {
        return Err(HandlerErr {
            code: "not_found",
            message: format!("unknown autosave session: {}", session),
            details: None,
        });
    };
    serde_json::to_value(persist.status(Instant::now())).map_err(|e| HandlerErr {
        code: "internal",
        message: e.to_string(),
        details: None,
    })
}

fn close(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = get_required_str(params, "session")?;
    let Some(mut persist) = state.sessions.remove(&session) else {
        return Ok(json!({ "closed": false, "droppedPending": false }));
    };
    let dropped = persist.cancel();
    if dropped {
        warn!(
            "event=autosave_session_close session={} status=ok dropped_pending=true",
            session
        );
    }
    Ok(json!({ "closed": true, "droppedPending": dropped }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "autosave.observe" => observe(state, &req.params),
        "autosave.saveNow" => save_now(state, &req.params),
        "autosave.status" => status(state, &req.params),
        "autosave.close" => close(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::UpsertSummary;

    #[test]
    fn observation_and_outcome_shapes() {
        let now = Instant::now();
        assert_eq!(
            observation_json(
                Observation::Scheduled {
                    deadline: now + Duration::from_millis(250)
                },
                now
            ),
            json!({ "state": "scheduled", "dueInMs": 250 })
        );
        assert_eq!(observation_json(Observation::Seeded, now)["state"], "seeded");
        assert_eq!(
            outcome_json(Some(CommitOutcome::Upserted(UpsertSummary {
                inserted: 1,
                updated: 2
            }))),
            json!({ "saved": true, "inserted": 1, "updated": 2 })
        );
        assert_eq!(outcome_json(None)["saved"], false);
    }
}
