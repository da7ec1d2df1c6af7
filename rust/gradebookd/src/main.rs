mod autosave;
mod config;
mod db;
mod error;
mod ipc;
mod logging;
mod notify;
mod store;
mod thresholds;

use std::io::{self, BufRead, Write};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Instant;

use log::{info, warn};
use serde_json::json;

fn write_response(stdout: &mut impl Write, resp: &serde_json::Value) {
    let _ = writeln!(
        stdout,
        "{}",
        serde_json::to_string(resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
    );
    let _ = stdout.flush();
}

fn handle_line(state: &mut ipc::AppState, stdout: &mut impl Write, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    let req: ipc::Request = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            // Can't reply without id.
            warn!("event=request_parse status=error error={}", e);
            write_response(
                stdout,
                &json!({ "ok": false, "error": { "code": "bad_json", "message": e.to_string() } }),
            );
            return;
        }
    };
    let resp = ipc::handle_request(state, req);
    write_response(stdout, &resp);
}

fn main() {
    let config = match config::DaemonConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("gradebookd: invalid configuration: {e:#}");
            std::process::exit(2);
        }
    };
    if let Err(e) = logging::init(&config) {
        eprintln!("gradebookd: logging unavailable: {e}");
    }
    let mut state = ipc::AppState::new(config);

    // stdin is read on its own thread so pending autosaves can fire while
    // the UI is idle.
    let (tx, rx) = mpsc::channel::<String>();
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    let mut stdout = io::stdout();
    loop {
        let next = match state.next_autosave_deadline() {
            Some(deadline) => rx.recv_timeout(deadline.saturating_duration_since(Instant::now())),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match next {
            Ok(line) => handle_line(&mut state, &mut stdout, &line),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        state.run_due_autosaves(Instant::now());
    }

    let dropped = state.teardown();
    info!("event=daemon_stop status=ok dropped_pending={}", dropped);
}
