//! Debounced, change-detecting persistence of a caller-owned snapshot.
//!
//! # Invariants
//! - The first observed value is the baseline; it is never written.
//! - At most one pending commit exists; a new change replaces it.
//! - The baseline only moves after a successful write.
//! - Failures become notices. Nothing is returned as an error.

use crate::error::{GradebookError, StoreError};
use crate::notify::{Notice, NotificationSink};
use crate::store::{is_blank_key, now_stamp, Collection, PersistenceService, Row, UpsertSummary};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

pub const DEFAULT_DELAY: Duration = Duration::from_millis(2000);
pub const UPDATED_AT_FIELD: &str = "updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Disabled,
    Empty,
    Unserializable,
    /// First value seen; recorded as already saved.
    Seeded,
    /// Matches the last saved value; any pending commit was dropped.
    Unchanged,
    Scheduled { deadline: Instant },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Upserted(UpsertSummary),
    Updated { rows: usize },
    Inserted { key: Option<Value> },
    Failed { message: String },
}

impl CommitOutcome {
    pub fn is_ok(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutosaveStatus {
    pub collection: Collection,
    pub key_field: String,
    pub enabled: bool,
    pub delay_ms: u64,
    pub pending: bool,
    pub due_in_ms: Option<u64>,
    pub last_committed_at: Option<String>,
    pub last_error: Option<String>,
}

struct PendingCommit {
    deadline: Instant,
    payload: Value,
    serialized: String,
}

pub struct AutoPersist<T> {
    collection: Collection,
    key_field: String,
    delay: Duration,
    enabled: bool,
    notify_on_success: bool,
    baseline: Option<String>,
    pending: Option<PendingCommit>,
    // Key handed out by the store when a keyless record was inserted.
    assigned_key: Option<Value>,
    last_committed_at: Option<String>,
    last_error: Option<String>,
    _snapshot: PhantomData<fn(&T)>,
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn stamp_row(item: Value, stamp: &str) -> Result<Row, StoreError> {
    match item {
        Value::Object(mut row) => {
            row.insert(UPDATED_AT_FIELD.to_string(), Value::String(stamp.to_string()));
            Ok(row)
        }
        _ => Err(StoreError::NotAnObject),
    }
}

impl<T: Serialize> AutoPersist<T> {
    pub fn new(collection: Collection, key_field: impl Into<String>) -> Self {
        Self {
            collection,
            key_field: key_field.into(),
            delay: DEFAULT_DELAY,
            enabled: true,
            notify_on_success: false,
            baseline: None,
            pending: None,
            assigned_key: None,
            last_committed_at: None,
            last_error: None,
            _snapshot: PhantomData,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_success_notices(mut self, on: bool) -> Self {
        self.notify_on_success = on;
        self
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    /// Applies to the next scheduled commit; a pending one keeps its deadline.
    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = delay;
    }

    /// Disabling drops any pending commit.
    pub fn set_enabled(&mut self, enabled: bool) {
        if !enabled {
            self.cancel();
        }
        self.enabled = enabled;
    }

    /// Drops the pending commit, if any. Returns whether one was dropped.
    pub fn cancel(&mut self) -> bool {
        let dropped = self.pending.take().is_some();
        if dropped {
            debug!(
                "event=autosave_cancelled collection={} status=ok",
                self.collection
            );
        }
        dropped
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    pub fn observe(&mut self, snapshot: Option<&T>, now: Instant) -> Observation {
        if !self.enabled {
            return Observation::Disabled;
        }
        let Some(snapshot) = snapshot else {
            return Observation::Empty;
        };
        let payload = match serde_json::to_value(snapshot) {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    "event=autosave_observe collection={} status=error error={}",
                    self.collection, e
                );
                return Observation::Unserializable;
            }
        };
        if is_empty(&payload) {
            return Observation::Empty;
        }
        // `Value` maps are key-sorted, so equal data serializes identically.
        let serialized = payload.to_string();

        match self.baseline.as_deref() {
            None => {
                self.baseline = Some(serialized);
                return Observation::Seeded;
            }
            Some(saved) if saved == serialized => {
                self.cancel();
                return Observation::Unchanged;
            }
            Some(_) => {}
        }

        if let Some(p) = &self.pending {
            if p.serialized == serialized {
                return Observation::Scheduled {
                    deadline: p.deadline,
                };
            }
        }

        let deadline = now + self.delay;
        self.pending = Some(PendingCommit {
            deadline,
            payload,
            serialized,
        });
        debug!(
            "event=autosave_scheduled collection={} delay_ms={}",
            self.collection,
            self.delay.as_millis()
        );
        Observation::Scheduled { deadline }
    }

    /// Commits the pending snapshot once its idle window has elapsed.
    pub fn poll<S, N>(&mut self, now: Instant, store: &mut S, sink: &mut N) -> Option<CommitOutcome>
    where
        S: PersistenceService + ?Sized,
        N: NotificationSink + ?Sized,
    {
        match &self.pending {
            Some(p) if p.deadline <= now => {}
            _ => return None,
        }
        let pending = self.pending.take()?;
        Some(self.commit(pending, store, sink))
    }

    /// Manual save: writes `snapshot` right away, bypassing the idle window.
    pub fn save_now<S, N>(
        &mut self,
        snapshot: Option<&T>,
        store: &mut S,
        sink: &mut N,
    ) -> Option<CommitOutcome>
    where
        S: PersistenceService + ?Sized,
        N: NotificationSink + ?Sized,
    {
        let payload = serde_json::to_value(snapshot?).ok()?;
        if is_empty(&payload) {
            return None;
        }
        self.cancel();
        let serialized = payload.to_string();
        Some(self.commit(
            PendingCommit {
                deadline: Instant::now(),
                payload,
                serialized,
            },
            store,
            sink,
        ))
    }

    pub fn status(&self, now: Instant) -> AutosaveStatus {
        AutosaveStatus {
            collection: self.collection,
            key_field: self.key_field.clone(),
            enabled: self.enabled,
            delay_ms: self.delay.as_millis() as u64,
            pending: self.pending.is_some(),
            due_in_ms: self
                .deadline()
                .map(|d| d.saturating_duration_since(now).as_millis() as u64),
            last_committed_at: self.last_committed_at.clone(),
            last_error: self.last_error.clone(),
        }
    }

    fn commit<S, N>(&mut self, pending: PendingCommit, store: &mut S, sink: &mut N) -> CommitOutcome
    where
        S: PersistenceService + ?Sized,
        N: NotificationSink + ?Sized,
    {
        let stamp = now_stamp();
        match self.write(pending.payload, &stamp, store) {
            Ok(outcome) => {
                self.baseline = Some(pending.serialized);
                self.last_committed_at = Some(stamp);
                self.last_error = None;
                info!(
                    "event=autosave_committed collection={} status=ok",
                    self.collection
                );
                if self.notify_on_success {
                    sink.notify(Notice::info(
                        "Saved",
                        format!("Changes to {} were saved.", self.collection),
                    ));
                }
                outcome
            }
            Err(source) => {
                let err = GradebookError::PersistenceWriteFailed {
                    collection: self.collection,
                    source,
                };
                warn!(
                    "event=autosave_committed collection={} status=error error={}",
                    self.collection, err
                );
                sink.notify(err.notice());
                let message = err.to_string();
                self.last_error = Some(message.clone());
                CommitOutcome::Failed { message }
            }
        }
    }

    fn write<S>(&mut self, payload: Value, stamp: &str, store: &mut S) -> Result<CommitOutcome, StoreError>
    where
        S: PersistenceService + ?Sized,
    {
        match payload {
            Value::Array(items) => {
                let rows = items
                    .into_iter()
                    .map(|item| stamp_row(item, stamp))
                    .collect::<Result<Vec<_>, _>>()?;
                let summary = store.upsert(self.collection, rows, &self.key_field)?;
                Ok(CommitOutcome::Upserted(summary))
            }
            record @ Value::Object(_) => {
                let row = stamp_row(record, stamp)?;
                let key = row
                    .get(&self.key_field)
                    .filter(|v| !is_blank_key(v))
                    .cloned()
                    .or_else(|| self.assigned_key.clone());
                match key {
                    Some(key) => {
                        let rows = store.update(self.collection, row, &self.key_field, &key)?;
                        if rows == 0 {
                            return Err(StoreError::NoMatch {
                                collection: self.collection,
                                key_field: self.key_field.clone(),
                                key: key.to_string(),
                            });
                        }
                        Ok(CommitOutcome::Updated { rows })
                    }
                    None => {
                        let stored = store.insert(self.collection, row)?;
                        self.assigned_key = stored
                            .get(&self.key_field)
                            .filter(|v| !is_blank_key(v))
                            .cloned();
                        Ok(CommitOutcome::Inserted {
                            key: self.assigned_key.clone(),
                        })
                    }
                }
            }
            _ => Err(StoreError::NotAnObject),
        }
    }
}
