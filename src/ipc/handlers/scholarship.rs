use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::require_student;
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;

/// Idempotent mark: a second mark succeeds and reports alreadyMarked so the
/// UI can say "status unchanged" instead of raising an error.
fn handle_mark(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    if let Err(e) = require_student(conn, &student_id) {
        return e.response(&req.id);
    }

    match conn.execute(
        "INSERT OR IGNORE INTO scholarship_marks(student_id, marked_at) VALUES(?, ?)",
        (&student_id, db::now_rfc3339()),
    ) {
        Ok(changed) => ok(
            &req.id,
            json!({
                "eligible": true,
                "alreadyMarked": changed == 0,
            }),
        ),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_unmark(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    if let Err(e) = require_student(conn, &student_id) {
        return e.response(&req.id);
    }

    match conn.execute(
        "DELETE FROM scholarship_marks WHERE student_id = ?",
        [&student_id],
    ) {
        Ok(changed) => ok(
            &req.id,
            json!({
                "eligible": false,
                "wasMarked": changed > 0,
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    if let Err(e) = require_student(conn, &student_id) {
        return e.response(&req.id);
    }

    let marked_at: Result<Option<String>, _> = conn
        .query_row(
            "SELECT marked_at FROM scholarship_marks WHERE student_id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional();
    match marked_at {
        Ok(m) => ok(
            &req.id,
            json!({ "eligible": m.is_some(), "markedAt": m }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Eligible students joined with their results for review and export.
/// Filters apply as a conjunction; students without a result are skipped
/// (never shown with a phantom score of zero). Ordering is deterministic:
/// score DESC, then roll number ASC.
///
/// One row per (student, result): a student with results in several exam
/// sets appears once per set, so single-exam exports must pass examSetId
/// to get one row per student.
fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_name = req
        .params
        .get("className")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let school = req
        .params
        .get("school")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let exam_set_id = req
        .params
        .get("examSetId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let mut sql = String::from(
        "SELECT s.id, s.roll_number, s.name, s.class_name, s.school, m.marked_at,
                r.exam_set_id, r.correct, r.wrong, r.unanswered, r.score, r.percentage
         FROM scholarship_marks m
         JOIN students s ON s.id = m.student_id
         JOIN results r ON r.student_id = s.id
         WHERE 1=1",
    );
    let mut binds: Vec<String> = Vec::new();
    if let Some(c) = &class_name {
        sql.push_str(" AND s.class_name = ?");
        binds.push(c.clone());
    }
    if let Some(s) = &school {
        sql.push_str(" AND s.school = ?");
        binds.push(s.clone());
    }
    if let Some(e) = &exam_set_id {
        sql.push_str(" AND r.exam_set_id = ?");
        binds.push(e.clone());
    }
    sql.push_str(" ORDER BY r.score DESC, s.roll_number ASC");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "rollNumber": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "className": r.get::<_, String>(3)?,
                "school": r.get::<_, String>(4)?,
                "markedAt": r.get::<_, String>(5)?,
                "examSetId": r.get::<_, String>(6)?,
                "correct": r.get::<_, i64>(7)?,
                "wrong": r.get::<_, i64>(8)?,
                "unanswered": r.get::<_, i64>(9)?,
                "score": r.get::<_, f64>(10)?,
                "percentage": r.get::<_, f64>(11)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(results) => ok(&req.id, json!({ "results": results })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scholarship.mark" => Some(handle_mark(state, req)),
        "scholarship.unmark" => Some(handle_unmark(state, req)),
        "scholarship.status" => Some(handle_status(state, req)),
        "scholarship.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
