//! Grade threshold editor for one school.
//!
//! `thresholds.open` mounts the editor: the school's stored configuration is
//! loaded (or a blank school row created) and becomes the autosave baseline.
//! Every edit replaces the in-memory configuration and is observed, so the
//! school row is rewritten once edits settle. Rejected edits leave the
//! configuration untouched and queue a notice.

use std::time::Instant;

use crate::autosave::{AutoPersist, CommitOutcome, Observation};
use crate::error::{GradebookError, StoreError};
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    get_optional_str, get_required_f64, get_required_index, get_required_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::notify::NotificationSink;
use crate::store::{Collection, Filter, PersistenceService, Row, SqliteStore};
use crate::thresholds::{
    add_threshold, coverage_issues, grade_for, percent_of, remove_threshold, update_field,
    GradeLevel, GradeThreshold, GradingThresholds, Scope, ThresholdError, ThresholdField, Track,
};
use log::{info, warn};
use serde::Serialize;
use serde_json::{json, Map, Value};

use super::autosave::{observation_json, outcome_json};
use super::setup::{autosave_setup, grading_setup, AutosaveSetup, GradingSetup};

const GRADE_THRESHOLDS_FIELD: &str = "grade_thresholds";
const SUBJECT_THRESHOLDS_FIELD: &str = "subject_thresholds";

/// The slice of a `schools` row the editor owns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchoolGrading {
    pub id: String,
    #[serde(flatten)]
    pub thresholds: GradingThresholds,
}

pub struct ThresholdEditor {
    school: SchoolGrading,
    autosave: AutoPersist<SchoolGrading>,
    default_total_marks: f64,
    warn_on_coverage: bool,
    // Set when the stored configuration could not be loaded.
    degraded: bool,
}

fn thresholds_from_row(row: &Row) -> Result<GradingThresholds, StoreError> {
    let mut picked = Map::new();
    for field in [GRADE_THRESHOLDS_FIELD, SUBJECT_THRESHOLDS_FIELD] {
        if let Some(v) = row.get(field).filter(|v| !v.is_null()) {
            picked.insert(field.to_string(), v.clone());
        }
    }
    Ok(serde_json::from_value(Value::Object(picked))?)
}

fn load_or_create<S>(store: &mut S, school_id: &str) -> Result<GradingThresholds, StoreError>
where
    S: PersistenceService + ?Sized,
{
    let rows = store.select(Collection::Schools, &Filter::all().eq("id", school_id), None)?;
    if let Some(row) = rows.first() {
        return thresholds_from_row(row);
    }
    let mut row = Row::new();
    row.insert("id".to_string(), Value::String(school_id.to_string()));
    row.insert(GRADE_THRESHOLDS_FIELD.to_string(), json!({}));
    row.insert(SUBJECT_THRESHOLDS_FIELD.to_string(), json!({}));
    store.insert(Collection::Schools, row)?;
    info!("event=school_created id={} status=ok", school_id);
    Ok(GradingThresholds::default())
}

impl ThresholdEditor {
    pub fn open<S, N>(
        store: &mut S,
        school_id: &str,
        autosave: AutosaveSetup,
        grading: GradingSetup,
        sink: &mut N,
    ) -> Self
    where
        S: PersistenceService + ?Sized,
        N: NotificationSink + ?Sized,
    {
        let (thresholds, degraded) = match load_or_create(store, school_id) {
            Ok(t) => (t, false),
            Err(source) => {
                let err = GradebookError::FetchFailed {
                    collection: Collection::Schools,
                    source,
                };
                warn!(
                    "event=thresholds_open school={} status=error error={}",
                    school_id, err
                );
                sink.notify(err.notice());
                (GradingThresholds::default(), true)
            }
        };

        let mut editor = Self {
            school: SchoolGrading {
                id: school_id.to_string(),
                thresholds,
            },
            autosave: AutoPersist::new(Collection::Schools, "id")
                .with_delay(autosave.delay)
                .with_success_notices(autosave.notify_on_success),
            default_total_marks: grading.default_total_marks,
            warn_on_coverage: grading.warn_on_coverage_issues,
            degraded,
        };
        if degraded {
            editor.autosave.set_enabled(false);
        } else {
            editor.autosave.observe(Some(&editor.school), Instant::now());
        }
        info!(
            "event=thresholds_open school={} status=ok degraded={}",
            school_id, degraded
        );
        editor
    }

    pub fn school_id(&self) -> &str {
        &self.school.id
    }

    pub fn thresholds(&self) -> &GradingThresholds {
        &self.school.thresholds
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.autosave.deadline()
    }

    pub fn poll<S, N>(&mut self, now: Instant, store: &mut S, sink: &mut N) -> Option<CommitOutcome>
    where
        S: PersistenceService + ?Sized,
        N: NotificationSink + ?Sized,
    {
        self.autosave.poll(now, store, sink)
    }

    pub fn cancel(&mut self) -> bool {
        self.autosave.cancel()
    }

    /// Applies `edit` to the scope's list and observes the result.
    pub fn edit<F>(&mut self, scope: &Scope, edit: F) -> Result<Observation, ThresholdError>
    where
        F: FnOnce(&[GradeThreshold]) -> Result<Vec<GradeThreshold>, ThresholdError>,
    {
        let next = edit(&self.school.thresholds.criteria(scope))?;
        self.school
            .thresholds
            .set_criteria(scope, next, self.default_total_marks);
        Ok(self.observe(Instant::now()))
    }

    pub fn set_total_marks(
        &mut self,
        scope: &Scope,
        total_marks: f64,
    ) -> Result<Observation, ThresholdError> {
        self.school.thresholds.set_total_marks(scope, total_marks)?;
        Ok(self.observe(Instant::now()))
    }

    fn observe(&mut self, now: Instant) -> Observation {
        self.autosave.observe(Some(&self.school), now)
    }

    pub fn save_now<S, N>(&mut self, store: &mut S, sink: &mut N) -> Option<CommitOutcome>
    where
        S: PersistenceService + ?Sized,
        N: NotificationSink + ?Sized,
    {
        // An editor that never loaded must not overwrite the stored config.
        if self.degraded {
            return None;
        }
        self.autosave.save_now(Some(&self.school), store, sink)
    }

    fn total_marks(&self, scope: &Scope) -> f64 {
        self.school
            .thresholds
            .total_marks(scope, self.default_total_marks)
    }

    pub fn view(&self, scope: &Scope) -> Value {
        let criteria = self.school.thresholds.criteria(scope);
        let total = self.total_marks(scope);
        let bands: Vec<Value> = criteria
            .iter()
            .enumerate()
            .map(|(index, b)| {
                json!({
                    "index": index,
                    "min": b.min,
                    "max": b.max,
                    "label": b.label,
                    "minPercent": percent_of(b.min, total),
                    "maxPercent": percent_of(b.max, total)
                })
            })
            .collect();
        let mut out = json!({
            "schoolId": self.school.id,
            "scope": scope_json(scope),
            "totalMarks": total,
            "bands": bands
        });
        if self.warn_on_coverage {
            out["issues"] = json!(coverage_issues(&criteria, total));
        }
        out
    }
}

fn scope_json(scope: &Scope) -> Value {
    match scope {
        Scope::Grade { level, track } => json!({ "grade": level.get(), "track": track }),
        Scope::Subject(id) => json!({ "subjectId": id }),
    }
}

fn parse_scope(params: &Value) -> Result<Scope, HandlerErr> {
    if let Some(subject) = get_optional_str(params, "subjectId")?.filter(|s| !s.is_empty()) {
        return Ok(Scope::Subject(subject));
    }
    let Some(raw) = params.get("grade").and_then(|v| v.as_i64()) else {
        return Err(HandlerErr::bad_params("missing grade or subjectId"));
    };
    let level = GradeLevel::new(raw).map_err(|e| HandlerErr::bad_params(e.to_string()))?;
    let track = match get_optional_str(params, "track")? {
        Some(t) if !t.is_empty() => {
            Track::parse(&t).map_err(|e| HandlerErr::bad_params(e.to_string()))?
        }
        _ => Track::Default,
    };
    Ok(Scope::Grade { level, track })
}

fn editor_not_open() -> HandlerErr {
    HandlerErr {
        code: "editor_not_open",
        message: "open a school's thresholds first".to_string(),
        details: None,
    }
}

fn editor(state: &mut AppState) -> Result<&mut ThresholdEditor, HandlerErr> {
    state.thresholds.as_mut().ok_or_else(editor_not_open)
}

/// Turns an edit result into a response body. Rejections are not IPC errors:
/// the notice carries the message and the view shows the unchanged list.
fn edit_response(
    state: &mut AppState,
    scope: &Scope,
    result: Result<Observation, ThresholdError>,
) -> Result<Value, HandlerErr> {
    let now = Instant::now();
    let (autosave, rejected) = match result {
        Ok(obs) => (observation_json(obs, now), None),
        Err(e) => {
            let err = GradebookError::from(e);
            info!("event=thresholds_edit status=rejected code={}", err.code());
            state.notices.notify(err.notice());
            (
                Value::Null,
                Some(json!({ "code": err.code(), "message": err.to_string() })),
            )
        }
    };
    let mut out = editor(state)?.view(scope);
    out["autosave"] = autosave;
    out["rejected"] = rejected.unwrap_or(Value::Null);
    Ok(out)
}

fn open(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    let Some(conn) = state.db.as_ref() else {
        return Err(HandlerErr::no_workspace());
    };
    let autosave = autosave_setup(conn, &state.config).unwrap_or_else(|e| {
        warn!("event=setup_load section=autosave status=error error={e}");
        AutosaveSetup {
            delay: state.config.autosave_delay,
            notify_on_success: false,
        }
    });
    let grading = grading_setup(conn, &state.config).unwrap_or_else(|e| {
        warn!("event=setup_load section=grading status=error error={e}");
        GradingSetup {
            default_total_marks: crate::thresholds::DEFAULT_TOTAL_MARKS,
            warn_on_coverage_issues: true,
        }
    });

    if let Some(mut previous) = state.thresholds.take() {
        if previous.cancel() {
            warn!(
                "event=thresholds_close school={} dropped_pending=true",
                previous.school_id()
            );
        }
    }

    let mut store = SqliteStore::new(conn);
    let editor = ThresholdEditor::open(&mut store, &school_id, autosave, grading, &mut state.notices);
    let degraded = editor.degraded;
    let thresholds = serde_json::to_value(editor.thresholds()).unwrap_or(Value::Null);
    state.thresholds = Some(editor);
    Ok(json!({
        "schoolId": school_id,
        "degraded": degraded,
        "thresholds": thresholds
    }))
}

fn criteria(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let scope = parse_scope(params)?;
    Ok(editor(state)?.view(&scope))
}

fn update_field_req(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let scope = parse_scope(params)?;
    let index = get_required_index(params, "index")?;
    let field = ThresholdField::parse(&get_required_str(params, "field")?)
        .map_err(|e| HandlerErr::bad_params(e.to_string()))?;
    let value = match params.get("value") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        None | Some(Value::Null) => String::new(),
        Some(_) => return Err(HandlerErr::bad_params("value must be string or number")),
    };
    let result = editor(state)?.edit(&scope, |seq| update_field(seq, index, field, &value));
    edit_response(state, &scope, result)
}

fn add(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let scope = parse_scope(params)?;
    let result = editor(state)?.edit(&scope, |seq| Ok(add_threshold(seq)));
    edit_response(state, &scope, result)
}

fn remove(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let scope = parse_scope(params)?;
    let index = get_required_index(params, "index")?;
    let result = editor(state)?.edit(&scope, |seq| remove_threshold(seq, index));
    edit_response(state, &scope, result)
}

fn set_total_marks(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let scope = parse_scope(params)?;
    let total = get_required_f64(params, "totalMarks")?;
    let result = editor(state)?.set_total_marks(&scope, total);
    edit_response(state, &scope, result)
}

fn evaluate(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let scope = parse_scope(params)?;
    let mark = get_required_f64(params, "mark")?;
    let editor = editor(state)?;
    let criteria = editor.school.thresholds.criteria(&scope);
    let total = editor.total_marks(&scope);
    let band = grade_for(&criteria, mark).map(|b| {
        json!({ "label": b.label, "min": b.min, "max": b.max })
    });
    Ok(json!({
        "mark": mark,
        "percent": percent_of(mark, total),
        "band": band
    }))
}

fn check(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let scope = parse_scope(params)?;
    let editor = editor(state)?;
    let total = editor.total_marks(&scope);
    let issues = coverage_issues(&editor.school.thresholds.criteria(&scope), total);
    Ok(json!({
        "totalMarks": total,
        "complete": issues.is_empty(),
        "issues": issues
    }))
}

fn save_now(state: &mut AppState, _params: &Value) -> Result<Value, HandlerErr> {
    let Some(conn) = state.db.as_ref() else {
        return Err(HandlerErr::no_workspace());
    };
    let editor = state.thresholds.as_mut().ok_or_else(editor_not_open)?;
    if editor.degraded {
        return Ok(json!({ "saved": false, "reason": "load_failed" }));
    }
    let mut store = SqliteStore::new(conn);
    Ok(outcome_json(editor.save_now(&mut store, &mut state.notices)))
}

fn status(state: &mut AppState, _params: &Value) -> Result<Value, HandlerErr> {
    let editor = editor(state)?;
    let mut out = serde_json::to_value(editor.autosave.status(Instant::now())).map_err(|e| {
        HandlerErr {
            code: "internal",
            message: e.to_string(),
            details: None,
        }
    })?;
    out["schoolId"] = json!(editor.school.id);
    out["degraded"] = json!(editor.degraded);
    Ok(out)
}

fn close(state: &mut AppState, _params: &Value) -> Result<Value, HandlerErr> {
    let Some(mut editor) = state.thresholds.take() else {
        return Ok(json!({ "closed": false, "droppedPending": false }));
    };
    let dropped = editor.cancel();
    info!(
        "event=thresholds_close school={} dropped_pending={}",
        editor.school_id(),
        dropped
    );
    Ok(json!({ "closed": true, "droppedPending": dropped }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "thresholds.open" => open(state, &req.params),
        "thresholds.criteria" => criteria(state, &req.params),
        "thresholds.updateField" => update_field_req(state, &req.params),
        "thresholds.add" => add(state, &req.params),
        "thresholds.remove" => remove(state, &req.params),
        "thresholds.setTotalMarks" => set_total_marks(state, &req.params),
        "thresholds.evaluate" => evaluate(state, &req.params),
        "thresholds.check" => check(state, &req.params),
        "thresholds.saveNow" => save_now(state, &req.params),
        "thresholds.status" => status(state, &req.params),
        "thresholds.close" => close(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
