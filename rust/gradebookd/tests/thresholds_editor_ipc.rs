use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
}
fn open_workspace(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    path: &std::path::Path,
) {
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": path.to_string_lossy() }),
    );
}

fn band_triples(view: &serde_json::Value) -> Vec<(f64, f64, String)> {
    view["bands"]
        .as_array()
        .expect("bands")
        .iter()
        .map(|b| {
            (
                b["min"].as_f64().expect("min"),
                b["max"].as_f64().expect("max"),
                b["label"].as_str().expect("label").to_string(),
            )
        })
        .collect()
}

#[test]
fn grade_ten_add_then_remove_restores_default_scale() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, workspace.path());

    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "thresholds.open",
        json!({ "schoolId": "sch-1" }),
    );
    assert_eq!(opened["degraded"], json!(false));
    assert_eq!(opened["thresholds"]["grade_thresholds"], json!({}));

    let initial = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "thresholds.criteria",
        json!({ "grade": 10 }),
    );
    let original = band_triples(&initial);
    let labels: Vec<&str> = original.iter().map(|(_, _, l)| l.as_str()).collect();
    assert_eq!(labels, vec!["A+", "A", "B", "C", "D", "F"]);
    assert_eq!(initial["bands"][0]["maxPercent"], json!("100.0"));
    assert_eq!(initial["issues"], json!([]));

    let added = request_ok(&mut stdin, &mut reader, "3", "thresholds.add", json!({ "grade": 10 }));
    assert_eq!(added["bands"].as_array().map(|b| b.len()), Some(7));
    assert_eq!(added["bands"][6]["label"], json!("New"));
    assert_eq!(added["autosave"]["state"], json!("scheduled"));
    assert!(added["rejected"].is_null());

    let removed = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "thresholds.remove",
        json!({ "grade": 10, "index": 6 }),
    );
    assert_eq!(band_triples(&removed), original);
}

#[test]
fn removing_the_last_band_is_rejected_with_a_notice() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, workspace.path());
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "thresholds.open",
        json!({ "schoolId": "sch-2" }),
    );

    for i in 0..5 {
        let view = request_ok(
            &mut stdin,
            &mut reader,
            &format!("rm-{}", i),
            "thresholds.remove",
            json!({ "subjectId": "math", "index": 0 }),
        );
        assert_eq!(view["bands"].as_array().map(|b| b.len()), Some(5 - i));
    }

    let last = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "thresholds.remove",
        json!({ "subjectId": "math", "index": 0 }),
    );
    assert_eq!(last["rejected"]["code"], json!("cannot_remove_last_threshold"));
    assert_eq!(band_triples(&last), vec![(0.0, 49.0, "F".to_string())]);

    let drained = request_ok(&mut stdin, &mut reader, "3", "notifications.drain", json!({}));
    let notices = drained["notices"].as_array().expect("notices");
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0]["title"], json!("Cannot remove threshold"));
    assert_eq!(notices[0]["kind"], json!("destructive"));
}

#[test]
fn numeric_fields_coerce_text_and_reject_garbage() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, workspace.path());
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "thresholds.open",
        json!({ "schoolId": "sch-3" }),
    );

    let view = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "thresholds.updateField",
        json!({ "grade": 8, "index": 0, "field": "min", "value": "85" }),
    );
    assert_eq!(view["bands"][0]["min"], json!(85.0));

    let view = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "thresholds.updateField",
        json!({ "grade": 8, "index": 1, "field": "max", "value": "" }),
    );
    assert_eq!(view["bands"][1]["max"], json!(0.0));

    let view = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "thresholds.updateField",
        json!({ "grade": 8, "index": 0, "field": "label", "value": " Distinction " }),
    );
    assert_eq!(view["bands"][0]["label"], json!(" Distinction "));

    let view = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "thresholds.updateField",
        json!({ "grade": 8, "index": 0, "field": "min", "value": "abc" }),
    );
    assert_eq!(view["rejected"]["code"], json!("validation_rejected"));
    assert_eq!(view["bands"][0]["min"], json!(85.0));

    let bad_field = request(
        &mut stdin,
        &mut reader,
        "6",
        "thresholds.updateField",
        json!({ "grade": 8, "index": 0, "field": "colour", "value": "red" }),
    );
    assert_eq!(error_code(&bad_field), "bad_params");

    let bad_grade = request(
        &mut stdin,
        &mut reader,
        "7",
        "thresholds.criteria",
        json!({ "grade": 5 }),
    );
    assert_eq!(error_code(&bad_grade), "bad_params");
}

#[test]
fn senior_tracks_edit_their_own_list() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, workspace.path());
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "thresholds.open",
        json!({ "schoolId": "sch-4" }),
    );

    let main = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "thresholds.updateField",
        json!({ "grade": 12, "track": "main", "index": 0, "field": "label", "value": "Excellent" }),
    );
    assert_eq!(main["bands"][0]["label"], json!("Excellent"));
    assert_eq!(main["scope"], json!({ "grade": 12, "track": "main" }));

    let sub = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "thresholds.criteria",
        json!({ "grade": 12, "track": "sub" }),
    );
    assert_eq!(sub["bands"][0]["label"], json!("A+"));

    // Junior levels have no tracks; the track is ignored.
    let junior = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "thresholds.updateField",
        json!({ "grade": 9, "track": "main", "index": 0, "field": "label", "value": "Top" }),
    );
    assert_eq!(junior["bands"][0]["label"], json!("Top"));
    let junior_default = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "thresholds.criteria",
        json!({ "grade": 9 }),
    );
    assert_eq!(junior_default["bands"][0]["label"], json!("Top"));
}

#[test]
fn evaluate_check_and_total_marks() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, workspace.path());
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "thresholds.open",
        json!({ "schoolId": "sch-5" }),
    );

    let eval = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "thresholds.evaluate",
        json!({ "grade": 10, "mark": 85 }),
    );
    assert_eq!(eval["band"]["label"], json!("A"));
    assert_eq!(eval["percent"], json!("85.0"));

    let check = request_ok(&mut stdin, &mut reader, "3", "thresholds.check", json!({ "grade": 10 }));
    assert_eq!(check["complete"], json!(true));

    let _ = request_ok(&mut stdin, &mut reader, "4", "thresholds.add", json!({ "grade": 10 }));
    let check = request_ok(&mut stdin, &mut reader, "5", "thresholds.check", json!({ "grade": 10 }));
    assert_eq!(check["complete"], json!(false));
    assert!(check["issues"]
        .as_array()
        .expect("issues")
        .iter()
        .any(|i| i["kind"] == json!("overlap")));

    let rejected = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "thresholds.setTotalMarks",
        json!({ "grade": 10, "totalMarks": 0 }),
    );
    assert_eq!(rejected["rejected"]["code"], json!("validation_rejected"));
    assert_eq!(rejected["totalMarks"], json!(100.0));

    let halved = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "thresholds.setTotalMarks",
        json!({ "grade": 10, "totalMarks": 50 }),
    );
    assert_eq!(halved["totalMarks"], json!(50.0));
    assert_eq!(halved["bands"][0]["maxPercent"], json!("200.0"));
}

#[test]
fn settled_edits_are_written_to_the_school_row_and_survive_reopen() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, workspace.path());
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "setup.update",
        json!({ "section": "autosave", "patch": { "delayMs": 100 } }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "thresholds.open",
        json!({ "schoolId": "sch-6" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "thresholds.updateField",
        json!({ "grade": 10, "index": 0, "field": "label", "value": "Top" }),
    );

    sleep(Duration::from_millis(800));

    let status = request_ok(&mut stdin, &mut reader, "4", "thresholds.status", json!({}));
    assert_eq!(status["pending"], json!(false));
    assert!(status["lastCommittedAt"].as_str().is_some(), "{}", status);

    let rows = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "records.select",
        json!({ "collection": "schools", "filter": { "id": "sch-6" } }),
    );
    let row = &rows["rows"][0];
    assert_eq!(row["grade_thresholds"]["10"]["default"][0]["label"], json!("Top"));
    assert!(row["updated_at"].as_str().is_some());

    let _ = request_ok(&mut stdin, &mut reader, "6", "thresholds.close", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "thresholds.open",
        json!({ "schoolId": "sch-6" }),
    );
    let view = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "thresholds.criteria",
        json!({ "grade": 10 }),
    );
    assert_eq!(view["bands"][0]["label"], json!("Top"));
}

#[test]
fn save_now_writes_immediately() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, workspace.path());
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "thresholds.open",
        json!({ "schoolId": "sch-7" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "thresholds.add",
        json!({ "subjectId": "science" }),
    );
    let saved = request_ok(&mut stdin, &mut reader, "3", "thresholds.saveNow", json!({}));
    assert_eq!(saved["saved"], json!(true));

    let rows = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "records.select",
        json!({ "collection": "schools", "filter": { "id": "sch-7" } }),
    );
    let science = &rows["rows"][0]["subject_thresholds"]["science"];
    assert_eq!(science["criteria"].as_array().map(|c| c.len()), Some(7));
    assert_eq!(science["totalMarks"], json!(100.0));
}

fn edit_top_label(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    value: &str,
) {
    let edited = request_ok(
        stdin,
        reader,
        id,
        "thresholds.updateField",
        json!({ "grade": 10, "index": 0, "field": "label", "value": value }),
    );
    assert_eq!(edited["autosave"]["state"], json!("scheduled"));
}

fn top_label(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, id: &str) -> String {
    let view = request_ok(stdin, reader, id, "thresholds.criteria", json!({ "grade": 10 }));
    view["bands"][0]["label"].as_str().unwrap_or("").to_string()
}

#[test]
fn unmounting_the_editor_discards_a_pending_edit() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let elsewhere = tempfile::tempdir().expect("tempdir");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, workspace.path());
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "setup.update",
        json!({ "section": "autosave", "patch": { "delayMs": 60000 } }),
    );

    // Explicit close.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "thresholds.open",
        json!({ "schoolId": "sch-8" }),
    );
    edit_top_label(&mut stdin, &mut reader, "3", "Closed");
    let closed = request_ok(&mut stdin, &mut reader, "4", "thresholds.close", json!({}));
    assert_eq!(closed, json!({ "closed": true, "droppedPending": true }));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "thresholds.open",
        json!({ "schoolId": "sch-8" }),
    );
    assert_eq!(top_label(&mut stdin, &mut reader, "6"), "A+");

    // Opening another school replaces the editor.
    edit_top_label(&mut stdin, &mut reader, "7", "Replaced");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "thresholds.open",
        json!({ "schoolId": "sch-9" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "thresholds.open",
        json!({ "schoolId": "sch-8" }),
    );
    assert_eq!(top_label(&mut stdin, &mut reader, "10"), "A+");

    // Switching workspaces unmounts it too.
    edit_top_label(&mut stdin, &mut reader, "11", "Switched");
    open_workspace(&mut stdin, &mut reader, elsewhere.path());
    let health = request_ok(&mut stdin, &mut reader, "12", "health", json!({}));
    assert_eq!(health["thresholdEditorOpen"], json!(false));
    open_workspace(&mut stdin, &mut reader, workspace.path());

    let rows = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "records.select",
        json!({ "collection": "schools", "filter": { "id": "sch-8" } }),
    );
    assert_eq!(rows["rows"][0]["grade_thresholds"], json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "thresholds.open",
        json!({ "schoolId": "sch-8" }),
    );
    assert_eq!(top_label(&mut stdin, &mut reader, "15"), "A+");
}
