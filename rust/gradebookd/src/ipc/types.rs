use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use log::{debug, info};
use rusqlite::Connection;
use serde::Deserialize;

use super::handlers::thresholds::ThresholdEditor;
use crate::autosave::AutoPersist;
use crate::config::DaemonConfig;
use crate::notify::NoticeQueue;
use crate::store::SqliteStore;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub config: DaemonConfig,
    pub notices: NoticeQueue,
    /// Named `autosave.observe` sessions over JSON snapshots.
    pub sessions: HashMap<String, AutoPersist<serde_json::Value>>,
    pub thresholds: Option<ThresholdEditor>,
}

impl AppState {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            workspace: None,
            db: None,
            config,
            notices: NoticeQueue::default(),
            sessions: HashMap::new(),
            thresholds: None,
        }
    }

    /// Earliest instant at which some pending commit becomes due.
    pub fn next_autosave_deadline(&self) -> Option<Instant> {
        self.sessions
            .values()
            .filter_map(|s| s.deadline())
            .chain(self.thresholds.as_ref().and_then(|t| t.deadline()))
            .min()
    }

    pub fn run_due_autosaves(&mut self, now: Instant) {
        let Some(conn) = self.db.as_ref() else {
            return;
        };
        let mut store = SqliteStore::new(conn);
        for (name, session) in self.sessions.iter_mut() {
            if let Some(outcome) = session.poll(now, &mut store, &mut self.notices) {
                debug!(
                    "event=autosave_session_commit session={} ok={}",
                    name,
                    outcome.is_ok()
                );
            }
        }
        if let Some(editor) = self.thresholds.as_mut() {
            editor.poll(now, &mut store, &mut self.notices);
        }
    }

    /// Unmounts every autosave owner. Pending commits are discarded, not written.
    pub fn teardown(&mut self) -> usize {
        let mut dropped = 0;
        for (_, mut session) in self.sessions.drain() {
            if session.cancel() {
                dropped += 1;
            }
        }
        if let Some(mut editor) = self.thresholds.take() {
            if editor.cancel() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            info!("event=autosave_teardown status=ok dropped={}", dropped);
        }
        dropped
    }
}
