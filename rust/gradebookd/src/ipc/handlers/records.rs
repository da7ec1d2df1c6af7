use crate::ipc::error::ok;
use crate::ipc::helpers::{
    as_row, get_collection, get_optional_bool, get_optional_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::store::{is_blank_key, Filter, Order, PersistenceService, SqliteStore};
use log::info;
use serde_json::{json, Value};

fn store(state: &AppState) -> Result<SqliteStore<'_>, HandlerErr> {
    state
        .db
        .as_ref()
        .map(SqliteStore::new)
        .ok_or_else(HandlerErr::no_workspace)
}

fn key_field(params: &Value, name: &str) -> Result<String, HandlerErr> {
    Ok(get_optional_str(params, name)?
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "id".to_string()))
}

fn required_key(params: &Value) -> Result<Value, HandlerErr> {
    match params.get("key") {
        Some(v) if !is_blank_key(v) => Ok(v.clone()),
        _ => Err(HandlerErr::bad_params("missing key")),
    }
}

fn select(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let collection = get_collection(params)?;
    let mut filter = Filter::all();
    match params.get("filter") {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for (field, value) in map {
                filter = filter.eq(field.clone(), value.clone());
            }
        }
        Some(_) => return Err(HandlerErr::bad_params("filter must be an object")),
    }
    let order = get_optional_str(params, "orderBy")?
        .filter(|s| !s.is_empty())
        .map(|field| {
            if get_optional_bool(params, "descending")?.unwrap_or(false) {
                Ok(Order::desc(field))
            } else {
                Ok(Order::asc(field))
            }
        })
        .transpose()?;

    let rows = store(state)?
        .select(collection, &filter, order.as_ref())
        .map_err(|e| HandlerErr::from_store(e, false))?;
    Ok(json!({ "rows": rows }))
}

fn insert(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let collection = get_collection(params)?;
    let row = as_row(params.get("row").unwrap_or(&Value::Null), "row")?;
    let stored = store(state)?
        .insert(collection, row)
        .map_err(|e| HandlerErr::from_store(e, true))?;
    info!(
        "event=record_insert collection={} status=ok",
        collection
    );
    Ok(json!({ "row": stored }))
}

fn update(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let collection = get_collection(params)?;
    let key_field = key_field(params, "keyField")?;
    let key = required_key(params)?;
    let patch = as_row(params.get("patch").unwrap_or(&Value::Null), "patch")?;
    let updated = store(state)?
        .update(collection, patch, &key_field, &key)
        .map_err(|e| HandlerErr::from_store(e, true))?;
    Ok(json!({ "updated": updated }))
}

fn upsert(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let collection = get_collection(params)?;
    let conflict_key = key_field(params, "conflictKey")?;
    let Some(items) = params.get("rows").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("rows must be an array"));
    };
    let rows = items
        .iter()
        .enumerate()
        .map(|(i, v)| as_row(v, &format!("rows[{}]", i)))
        .collect::<Result<Vec<_>, _>>()?;
    let summary = store(state)?
        .upsert(collection, rows, &conflict_key)
        .map_err(|e| HandlerErr::from_store(e, true))?;
    info!(
        "event=record_upsert collection={} inserted={} updated={}",
        collection, summary.inserted, summary.updated
    );
    Ok(json!({ "inserted": summary.inserted, "updated": summary.updated }))
}

fn delete(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let collection = get_collection(params)?;
    let key_field = key_field(params, "keyField")?;
    let key = required_key(params)?;
    let soft = get_optional_bool(params, "soft")?.unwrap_or(true);
    let deleted = store(state)?
        .delete(collection, &key_field, &key, soft)
        .map_err(|e| HandlerErr::from_store(e, true))?;
    info!(
        "event=record_delete collection={} soft={} rows={}",
        collection, soft, deleted
    );
    Ok(json!({ "deleted": deleted, "soft": soft }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "records.select" => select(state, &req.params),
        "records.insert" => insert(state, &req.params),
        "records.update" => update(state, &req.params),
        "records.upsert" => upsert(state, &req.params),
        "records.delete" => delete(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
