use crate::ipc::error::ok;
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_drain(state: &mut AppState, req: &Request) -> serde_json::Value {
    let notices = state.notices.drain();
    ok(&req.id, json!({ "notices": notices }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "notifications.drain" => Some(handle_drain(state, req)),
        _ => None,
    }
}
