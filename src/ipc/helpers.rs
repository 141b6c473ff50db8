use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeMap;

use crate::db;
use crate::scoring::{AnswerKey, ScoreError, ScoredOutcome, ScoringPolicy};

pub struct HandlerErr {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        crate::ipc::error::err(id, &self.code, self.message, self.details)
    }
}

impl From<ScoreError> for HandlerErr {
    fn from(e: ScoreError) -> Self {
        Self {
            code: e.code,
            message: e.message,
            details: e.details,
        }
    }
}

pub fn db_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

pub fn require_student(conn: &Connection, student_id: &str) -> Result<(), HandlerErr> {
    let found: Option<String> = conn
        .query_row("SELECT id FROM students WHERE id = ?", [student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_err)?;
    if found.is_none() {
        return Err(HandlerErr {
            code: "not_found".to_string(),
            message: "student not found".to_string(),
            details: Some(json!({ "studentId": student_id })),
        });
    }
    Ok(())
}

pub fn load_answer_key(conn: &Connection, exam_set_id: &str) -> Result<AnswerKey, HandlerErr> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT answer_key FROM exam_sets WHERE id = ?",
            [exam_set_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    let Some(raw) = raw else {
        return Err(HandlerErr {
            code: "not_found".to_string(),
            message: "exam set not found".to_string(),
            details: Some(json!({ "examSetId": exam_set_id })),
        });
    };
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| HandlerErr::new("db_query_failed", format!("stored answer key unreadable: {}", e)))?;
    Ok(AnswerKey::from_json(&value)?)
}

/// `params.policy` is optional; absent means the portal's raw-correct scoring.
pub fn parse_policy(params: &serde_json::Value) -> Result<ScoringPolicy, HandlerErr> {
    let Some(raw) = params.get("policy") else {
        return Ok(ScoringPolicy::RawCorrect);
    };
    if raw.is_null() {
        return Ok(ScoringPolicy::RawCorrect);
    }
    let kind = raw.get("type").and_then(|v| v.as_str());
    match kind {
        Some("rawCorrect") => Ok(ScoringPolicy::RawCorrect),
        Some("perWrongPenalty") => {
            let Some(per_wrong) = raw.get("perWrong").and_then(|v| v.as_f64()) else {
                return Err(HandlerErr::new(
                    "bad_params",
                    "perWrongPenalty policy requires numeric perWrong",
                ));
            };
            if per_wrong < 0.0 {
                return Err(HandlerErr::new("bad_params", "perWrong must be >= 0"));
            }
            Ok(ScoringPolicy::PerWrongPenalty(per_wrong))
        }
        _ => Err(HandlerErr::new(
            "bad_params",
            "policy.type must be rawCorrect or perWrongPenalty",
        )),
    }
}

/// Parse the OMR-shaped `{qno: option|null}` map. Untrusted input: numeric
/// keys only, values string or null.
pub fn parse_answers(
    raw: &serde_json::Value,
) -> Result<BTreeMap<u32, Option<String>>, HandlerErr> {
    let Some(obj) = raw.as_object() else {
        return Err(HandlerErr::new(
            "bad_params",
            "answers must be an object of qno -> option|null",
        ));
    };
    let mut out = BTreeMap::new();
    for (k, v) in obj {
        let Ok(qno) = k.parse::<u32>() else {
            return Err(HandlerErr {
                code: "bad_params".to_string(),
                message: format!("answers has non-numeric question number: {}", k),
                details: Some(json!({ "key": k })),
            });
        };
        let chosen = if v.is_null() {
            None
        } else if let Some(s) = v.as_str() {
            Some(s.to_string())
        } else {
            return Err(HandlerErr {
                code: "bad_params".to_string(),
                message: format!("answer for question {} must be a string or null", qno),
                details: Some(json!({ "qno": qno })),
            });
        };
        out.insert(qno, chosen);
    }
    Ok(out)
}

pub fn submission_exists(
    conn: &Connection,
    student_id: &str,
    exam_set_id: &str,
) -> Result<bool, HandlerErr> {
    let found: Option<String> = conn
        .query_row(
            "SELECT student_id FROM submissions WHERE student_id = ? AND exam_set_id = ?",
            (student_id, exam_set_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    Ok(found.is_some())
}

pub struct StoredResult {
    pub version: i64,
    pub computed_at: String,
    pub overwrote: bool,
}

/// Whole-row result upsert keyed on (student, set). Replaces every field and
/// bumps version; a result may never exist without its backing submission.
pub fn upsert_result(
    conn: &Connection,
    student_id: &str,
    exam_set_id: &str,
    outcome: &ScoredOutcome,
) -> Result<StoredResult, HandlerErr> {
    if !submission_exists(conn, student_id, exam_set_id)? {
        return Err(HandlerErr {
            code: "orphan_result".to_string(),
            message: "no submission on file for this student and exam set".to_string(),
            details: Some(json!({
                "studentId": student_id,
                "examSetId": exam_set_id
            })),
        });
    }

    let prior: Option<i64> = conn
        .query_row(
            "SELECT version FROM results WHERE student_id = ? AND exam_set_id = ?",
            (student_id, exam_set_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;

    let computed_at = db::now_rfc3339();
    conn.execute(
        "INSERT INTO results(student_id, exam_set_id, correct, wrong, unanswered,
                             score, percentage, version, computed_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 1, ?)
         ON CONFLICT(student_id, exam_set_id) DO UPDATE SET
           correct = excluded.correct,
           wrong = excluded.wrong,
           unanswered = excluded.unanswered,
           score = excluded.score,
           percentage = excluded.percentage,
           version = results.version + 1,
           computed_at = excluded.computed_at",
        (
            student_id,
            exam_set_id,
            outcome.correct,
            outcome.wrong,
            outcome.unanswered,
            outcome.score,
            outcome.percentage,
            &computed_at,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed".to_string(),
        message: e.to_string(),
        details: Some(json!({ "table": "results" })),
    })?;

    Ok(StoredResult {
        version: prior.map(|v| v + 1).unwrap_or(1),
        computed_at,
        overwrote: prior.is_some(),
    })
}

pub fn result_payload(
    outcome: &ScoredOutcome,
    stored: &StoredResult,
) -> serde_json::Value {
    json!({
        "correct": outcome.correct,
        "wrong": outcome.wrong,
        "unanswered": outcome.unanswered,
        "totalQuestions": outcome.total_questions,
        "score": outcome.score,
        "percentage": outcome.percentage,
        "version": stored.version,
        "computedAt": stored.computed_at,
    })
}
