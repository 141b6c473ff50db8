use crate::analytics::{compute_question_stats, StatsContext};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_question_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let exam_set_id = match req.params.get("examSetId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing examSetId", None),
    };

    let ctx = StatsContext {
        conn,
        exam_set_id: &exam_set_id,
    };
    match compute_question_stats(&ctx) {
        Ok(stats) => ok(
            &req.id,
            json!({
                "examSetId": exam_set_id,
                "questions": stats,
            }),
        ),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "analytics.questionStats" => Some(handle_question_stats(state, req)),
        _ => None,
    }
}
