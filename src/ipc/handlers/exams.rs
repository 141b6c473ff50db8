use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{validate_set, AnswerKey, Question};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_exams_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    let year = match req.params.get("year").and_then(|v| v.as_i64()) {
        Some(v) if v > 0 => v,
        _ => return err(&req.id, "bad_params", "missing/invalid year", None),
    };
    let question_count = match req.params.get("questionCount").and_then(|v| v.as_i64()) {
        Some(v) if v > 0 => v,
        _ => return err(&req.id, "bad_params", "missing/invalid questionCount", None),
    };

    let exam_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO exams(id, name, year, question_count) VALUES(?, ?, ?, ?)",
        (&exam_id, &name, year, question_count),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "examId": exam_id }))
}

fn handle_exams_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn
        .prepare("SELECT id, name, year, question_count FROM exams ORDER BY year DESC, name")
    {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "year": r.get::<_, i64>(2)?,
                "questionCount": r.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(exams) => ok(&req.id, json!({ "exams": exams })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_exams_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let exam_id = match req.params.get("examId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing examId", None),
    };

    // FK cascade removes the exam's sets and their submissions/results.
    match conn.execute("DELETE FROM exams WHERE id = ?", [&exam_id]) {
        Ok(0) => err(&req.id, "not_found", "exam not found", None),
        Ok(_) => ok(&req.id, json!({ "deleted": true })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_exam_sets_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let exam_id = match req.params.get("examId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing examId", None),
    };
    let class_name = match req.params.get("className").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing className", None),
    };
    let set_name = match req.params.get("setName").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing setName", None),
    };
    let Some(questions_raw) = req.params.get("questions") else {
        return err(&req.id, "bad_params", "missing questions[]", None);
    };
    let Some(key_raw) = req.params.get("answerKey") else {
        return err(&req.id, "bad_params", "missing answerKey", None);
    };

    let questions: Vec<Question> = match serde_json::from_value(questions_raw.clone()) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "bad_params",
                format!("questions must be [{{qno, question, options}}]: {}", e),
                None,
            )
        }
    };
    let key = match AnswerKey::from_json(key_raw) {
        Ok(k) => k,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };
    if let Err(e) = validate_set(&questions, &key) {
        return err(&req.id, &e.code, e.message, e.details);
    }

    let exam_exists: Option<String> = match conn
        .query_row("SELECT id FROM exams WHERE id = ?", [&exam_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exam_exists.is_none() {
        return err(&req.id, "not_found", "exam not found", None);
    }

    let set_id = Uuid::new_v4().to_string();
    let questions_json = match serde_json::to_string(&questions) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
    };
    let key_json = key_raw.to_string();

    match conn.execute(
        "INSERT INTO exam_sets(id, exam_id, class_name, set_name, questions, answer_key)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&set_id, &exam_id, &class_name, &set_name, &questions_json, &key_json),
    ) {
        Ok(_) => ok(&req.id, json!({ "examSetId": set_id })),
        Err(rusqlite::Error::SqliteFailure(e, msg))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            err(
                &req.id,
                "conflict",
                "a set with this class and set name already exists for the exam",
                Some(json!({ "sqlite": msg })),
            )
        }
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_exam_sets_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let exam_id = match req.params.get("examId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing examId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, class_name, set_name, questions FROM exam_sets
         WHERE exam_id = ? ORDER BY class_name, set_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&exam_id], |r| {
            let questions_raw: String = r.get(3)?;
            let count = serde_json::from_str::<Vec<Question>>(&questions_raw)
                .map(|q| q.len())
                .unwrap_or(0);
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "className": r.get::<_, String>(1)?,
                "setName": r.get::<_, String>(2)?,
                "questionCount": count,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(sets) => ok(&req.id, json!({ "sets": sets })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_exam_sets_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let set_id = match req.params.get("examSetId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing examSetId", None),
    };

    let row: Result<Option<(String, String, String, String, String)>, _> = conn
        .query_row(
            "SELECT exam_id, class_name, set_name, questions, answer_key
             FROM exam_sets WHERE id = ?",
            [&set_id],
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
        Ok(Some((exam_id, class_name, set_name, questions, answer_key))) => {
            let questions: serde_json::Value =
                serde_json::from_str(&questions).unwrap_or(serde_json::Value::Null);
            let answer_key: serde_json::Value =
                serde_json::from_str(&answer_key).unwrap_or(serde_json::Value::Null);
            ok(
                &req.id,
                json!({
                    "examSetId": set_id,
                    "examId": exam_id,
                    "className": class_name,
                    "setName": set_name,
                    "questions": questions,
                    "answerKey": answer_key,
                }),
            )
        }
        Ok(None) => err(&req.id, "not_found", "exam set not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exams.create" => Some(handle_exams_create(state, req)),
        "exams.list" => Some(handle_exams_list(state, req)),
        "exams.delete" => Some(handle_exams_delete(state, req)),
        "examSets.create" => Some(handle_exam_sets_create(state, req)),
        "examSets.list" => Some(handle_exam_sets_list(state, req)),
        "examSets.get" => Some(handle_exam_sets_get(state, req)),
        _ => None,
    }
}
