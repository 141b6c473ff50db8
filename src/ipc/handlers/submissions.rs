use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    load_answer_key, parse_answers, parse_policy, require_student, result_payload, upsert_result,
};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{score, Submission};
use rusqlite::{OptionalExtension, TransactionBehavior};
use serde_json::json;

/// OMR path: per-question answers in, scored result out, both rows written in
/// one transaction. Re-submission overwrites the prior submission and result.
fn handle_submit_answers(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let Some(answers_raw) = req.params.get("answers") else {
        return err(&req.id, "bad_params", "missing answers", None);
    };

    let answers = match parse_answers(answers_raw) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let policy = match parse_policy(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = require_student(conn, &student_id) {
        return e.response(&req.id);
    }
    let key = match load_answer_key(conn, &exam_set_id) {
        Ok(k) => k,
        Err(e) => return e.response(&req.id),
    };

    // Score against the key snapshot before touching storage; a rejected
    // submission must leave no partial rows behind.
    let outcome = match score(&Submission::PerQuestion(answers.clone()), &key, policy) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    let answers_json = match serde_json::to_string(
        &answers
            .iter()
            .map(|(q, a)| (q.to_string(), a.clone()))
            .collect::<std::collections::BTreeMap<_, _>>(),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
    };

    let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO submissions(student_id, exam_set_id, kind, answers, correct, wrong, submitted_at)
         VALUES(?, ?, 'answers', ?, NULL, NULL, ?)
         ON CONFLICT(student_id, exam_set_id) DO UPDATE SET
           kind = 'answers',
           answers = excluded.answers,
           correct = NULL,
           wrong = NULL,
           submitted_at = excluded.submitted_at",
        (&student_id, &exam_set_id, &answers_json, db::now_rfc3339()),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
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

/// Manual path: pre-tallied correct/wrong counts. Same outcome shape and
/// percentage formula as the per-question path.
fn handle_submit_tally(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    // try_from, not `as`: an out-of-range count must be rejected, never wrapped.
    let correct = match req
        .params
        .get("correct")
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok())
    {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing/invalid correct count", None),
    };
    let wrong = match req
        .params
        .get("wrong")
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok())
    {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing/invalid wrong count", None),
    };

    let policy = match parse_policy(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = require_student(conn, &student_id) {
        return e.response(&req.id);
    }
    let key = match load_answer_key(conn, &exam_set_id) {
        Ok(k) => k,
        Err(e) => return e.response(&req.id),
    };

    let outcome = match score(&Submission::Tallied { correct, wrong }, &key, policy) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO submissions(student_id, exam_set_id, kind, answers, correct, wrong, submitted_at)
         VALUES(?, ?, 'tally', NULL, ?, ?, ?)
         ON CONFLICT(student_id, exam_set_id) DO UPDATE SET
           kind = 'tally',
           answers = NULL,
           correct = excluded.correct,
           wrong = excluded.wrong,
           submitted_at = excluded.submitted_at",
        (&student_id, &exam_set_id, correct, wrong, db::now_rfc3339()),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
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

fn handle_submissions_get(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let row: Result<
        Option<(String, Option<String>, Option<i64>, Option<i64>, String)>,
        _,
    > = conn
        .query_row(
            "SELECT kind, answers, correct, wrong, submitted_at
             FROM submissions WHERE student_id = ? AND exam_set_id = ?",
            (&student_id, &exam_set_id),
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                ))
            },
        )
        .optional();

    match row {
        Ok(Some((kind, answers, correct, wrong, submitted_at))) => {
            let answers: serde_json::Value = answers
                .as_deref()
                .and_then(|a| serde_json::from_str(a).ok())
                .unwrap_or(serde_json::Value::Null);
            ok(
                &req.id,
                json!({
                    "studentId": student_id,
                    "examSetId": exam_set_id,
                    "kind": kind,
                    "answers": answers,
                    "correct": correct,
                    "wrong": wrong,
                    "submittedAt": submitted_at,
                }),
            )
        }
        Ok(None) => err(&req.id, "not_found", "submission not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "submissions.submitAnswers" => Some(handle_submit_answers(state, req)),
        "submissions.submitTally" => Some(handle_submit_tally(state, req)),
        "submissions.get" => Some(handle_submissions_get(state, req)),
        _ => None,
    }
}
