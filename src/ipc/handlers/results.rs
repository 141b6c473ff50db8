use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    load_answer_key, parse_policy, result_payload, upsert_result, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{score, Submission};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use serde_json::json;
use std::collections::BTreeMap;

/// Rebuild the scoring input from a stored submission row.
fn load_submission(
    conn: &Connection,
    student_id: &str,
    exam_set_id: &str,
) -> Result<Option<Submission>, HandlerErr> {
    let row: Option<(String, Option<String>, Option<i64>, Option<i64>)> = conn
        .query_row(
            "SELECT kind, answers, correct, wrong
             FROM submissions WHERE student_id = ? AND exam_set_id = ?",
            (student_id, exam_set_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let Some((kind, answers, correct, wrong)) = row else {
        return Ok(None);
    };

    match kind.as_str() {
        "answers" => {
            let raw = answers.unwrap_or_else(|| "{}".to_string());
            let parsed: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
                HandlerErr::new("db_query_failed", format!("stored answers unreadable: {}", e))
            })?;
            let mut map: BTreeMap<u32, Option<String>> = BTreeMap::new();
            if let Some(obj) = parsed.as_object() {
                for (k, v) in obj {
                    let Ok(qno) = k.parse::<u32>() else {
                        continue;
                    };
                    map.insert(qno, v.as_str().map(|s| s.to_string()));
                }
            }
            Ok(Some(Submission::PerQuestion(map)))
        }
        "tally" => Ok(Some(Submission::Tallied {
            correct: correct.unwrap_or(0) as u32,
            wrong: wrong.unwrap_or(0) as u32,
        })),
        other => Err(HandlerErr::new(
            "db_query_failed",
            format!("unknown submission kind: {}", other),
        )),
    }
}

/// Recompute a student's result from the stored submission against the
/// current key snapshot. Idempotent in final state; version always bumps so
/// an optimistic caller can detect a concurrent rescore.
fn handle_rescore(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let exam_set_id = match req.params.get("examSetId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing examSetId", None),
    };
    let expected_version = req.params.get("expectedVersion").and_then(|v| v.as_i64());

    let policy = match parse_policy(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let key = match load_answer_key(conn, &exam_set_id) {
        Ok(k) => k,
        Err(e) => return e.response(&req.id),
    };
    let submission = match load_submission(conn, &student_id, &exam_set_id) {
        Ok(Some(s)) => s,
        Ok(None) => {
            return err(
                &req.id,
                "orphan_result",
                "cannot rescore: no submission on file for this student and exam set",
                Some(json!({ "studentId": student_id, "examSetId": exam_set_id })),
            )
        }
        Err(e) => return e.response(&req.id),
    };

    let outcome = match score(&submission, &key, policy) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };

    if let Some(expected) = expected_version {
        let current: Option<i64> = match tx
            .query_row(
                "SELECT version FROM results WHERE student_id = ? AND exam_set_id = ?",
                (&student_id, &exam_set_id),
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if current != Some(expected) {
            return err(
                &req.id,
                "conflict",
                "result was modified concurrently; re-read and retry",
                Some(json!({
                    "expectedVersion": expected,
                    "currentVersion": current
                })),
            );
        }
    }

    let stored = match upsert_result(&tx, &student_id, &exam_set_id, &outcome) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "result": result_payload(&outcome, &stored),
            "overwrote": stored.overwrote,
        }),
    )
}

const RESULT_JOIN_SELECT: &str = "SELECT r.student_id, s.roll_number, s.name, s.class_name, s.school,
        r.exam_set_id, es.exam_id, e.name, e.year, es.class_name, es.set_name,
        r.correct, r.wrong, r.unanswered, r.score, r.percentage, r.version, r.computed_at
 FROM results r
 JOIN students s ON s.id = r.student_id
 JOIN exam_sets es ON es.id = r.exam_set_id
 JOIN exams e ON e.id = es.exam_id";

fn result_join_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "studentId": r.get::<_, String>(0)?,
        "rollNumber": r.get::<_, String>(1)?,
        "name": r.get::<_, String>(2)?,
        "className": r.get::<_, String>(3)?,
        "school": r.get::<_, String>(4)?,
        "examSetId": r.get::<_, String>(5)?,
        "examId": r.get::<_, String>(6)?,
        "examName": r.get::<_, String>(7)?,
        "year": r.get::<_, i64>(8)?,
        "setClassName": r.get::<_, String>(9)?,
        "setName": r.get::<_, String>(10)?,
        "correct": r.get::<_, i64>(11)?,
        "wrong": r.get::<_, i64>(12)?,
        "unanswered": r.get::<_, i64>(13)?,
        "score": r.get::<_, f64>(14)?,
        "percentage": r.get::<_, f64>(15)?,
        "version": r.get::<_, i64>(16)?,
        "computedAt": r.get::<_, String>(17)?,
    }))
}

fn handle_results_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let exam_set_id = match req.params.get("examSetId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing examSetId", None),
    };

    let sql = format!(
        "{} WHERE r.student_id = ? AND r.exam_set_id = ?",
        RESULT_JOIN_SELECT
    );
    let row = conn
        .query_row(&sql, (&student_id, &exam_set_id), |r| result_join_row(r))
        .optional();
    match row {
        Ok(Some(v)) => ok(&req.id, v),
        Ok(None) => err(&req.id, "not_found", "result not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn list_results(
    conn: &Connection,
    req: &Request,
    where_clause: &str,
    bind: &str,
) -> serde_json::Value {
    let sql = format!(
        "{} WHERE {} ORDER BY r.computed_at DESC, s.roll_number",
        RESULT_JOIN_SELECT, where_clause
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([bind], |r| result_join_row(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(results) => ok(&req.id, json!({ "results": results })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_results_get_by_roll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let roll = match req.params.get("rollNumber").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing rollNumber", None),
    };
    list_results(conn, req, "s.roll_number = ?", &roll)
}

fn handle_results_list_by_class(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_name = match req.params.get("className").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing className", None),
    };
    list_results(conn, req, "s.class_name = ?", &class_name)
}

fn handle_results_list_by_school(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let school = match req.params.get("school").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing school", None),
    };
    list_results(conn, req, "s.school = ?", &school)
}

/// Remove a result together with its backing submission, atomically, so the
/// no-orphan invariant holds from both directions.
fn handle_results_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let exam_set_id = match req.params.get("examSetId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing examSetId", None),
    };

    let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let deleted = match tx.execute(
        "DELETE FROM results WHERE student_id = ? AND exam_set_id = ?",
        (&student_id, &exam_set_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if deleted == 0 {
        return err(&req.id, "not_found", "result not found", None);
    }
    if let Err(e) = tx.execute(
        "DELETE FROM submissions WHERE student_id = ? AND exam_set_id = ?",
        (&student_id, &exam_set_id),
    ) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.rescore" => Some(handle_rescore(state, req)),
        "results.get" => Some(handle_results_get(state, req)),
        "results.getByRoll" => Some(handle_results_get_by_roll(state, req)),
        "results.listByClass" => Some(handle_results_list_by_class(state, req)),
        "results.listBySchool" => Some(handle_results_list_by_school(state, req)),
        "results.delete" => Some(handle_results_delete(state, req)),
        _ => None,
    }
}
