use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;

use crate::scoring::{round_off_2_decimals, AnswerKey, Question, ScoreError};

#[derive(Debug, Clone)]
pub struct StatsContext<'a> {
    pub conn: &'a Connection,
    pub exam_set_id: &'a str,
}

/// Per-question difficulty row, rebuilt from raw submissions on every call.
/// Never cached: late or corrected submissions must always be reflected.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionStat {
    pub qno: u32,
    pub question_text: String,
    pub options: std::collections::BTreeMap<String, String>,
    pub correct_option: String,
    pub total_attempted: u32,
    pub correct_count: u32,
    pub incorrect_count: u32,
    pub accuracy_percent: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct QuestionTally {
    attempted: u32,
    correct: u32,
}

/// accuracy = round2(100 * correct / attempted), 0 for an unattempted
/// question. Unanswered bubbles are excluded from the denominator.
pub fn question_accuracy(correct: u32, attempted: u32) -> f64 {
    if attempted == 0 {
        return 0.0;
    }
    round_off_2_decimals(100.0 * correct as f64 / attempted as f64)
}

/// Scan every per-question submission of the set and fold it into per-qno
/// counters. Tally submissions carry no per-question data and are skipped.
/// Output is ordered by qno ascending, matching the question sequence.
pub fn compute_question_stats(ctx: &StatsContext<'_>) -> Result<Vec<QuestionStat>, ScoreError> {
    let conn = ctx.conn;

    let set_row: Option<(String, String)> = conn
        .query_row(
            "SELECT questions, answer_key FROM exam_sets WHERE id = ?",
            [ctx.exam_set_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| ScoreError::new("db_query_failed", e.to_string()))?;
    let Some((questions_raw, key_raw)) = set_row else {
        return Err(ScoreError::new("not_found", "exam set not found"));
    };

    let questions: Vec<Question> = serde_json::from_str(&questions_raw)
        .map_err(|e| ScoreError::new("db_query_failed", format!("stored questions unreadable: {}", e)))?;
    let key_value: serde_json::Value = serde_json::from_str(&key_raw)
        .map_err(|e| ScoreError::new("db_query_failed", format!("stored answer key unreadable: {}", e)))?;
    let key = AnswerKey::from_json(&key_value)?;

    let mut stmt = conn
        .prepare(
            "SELECT answers FROM submissions
             WHERE exam_set_id = ? AND kind = 'answers' AND answers IS NOT NULL",
        )
        .map_err(|e| ScoreError::new("db_query_failed", e.to_string()))?;
    let answer_blobs: Vec<String> = stmt
        .query_map([ctx.exam_set_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| ScoreError::new("db_query_failed", e.to_string()))?;

    let mut tallies: HashMap<u32, QuestionTally> = HashMap::new();
    for blob in &answer_blobs {
        let parsed: serde_json::Value = serde_json::from_str(blob)
            .map_err(|e| ScoreError::new("db_query_failed", format!("stored answers unreadable: {}", e)))?;
        let Some(obj) = parsed.as_object() else {
            continue;
        };
        for (qno_raw, chosen) in obj {
            let Ok(qno) = qno_raw.parse::<u32>() else {
                continue;
            };
            let Some(chosen) = chosen.as_str() else {
                continue; // blank bubble
            };
            let entry = tallies.entry(qno).or_default();
            entry.attempted += 1;
            if key.correct_option(qno) == Some(chosen) {
                entry.correct += 1;
            }
        }
    }

    let mut stats: Vec<QuestionStat> = questions
        .iter()
        .map(|q| {
            let tally = tallies.get(&q.qno).copied().unwrap_or_default();
            QuestionStat {
                qno: q.qno,
                question_text: q.question.clone(),
                options: q.options.clone(),
                correct_option: key
                    .correct_option(q.qno)
                    .unwrap_or_default()
                    .to_string(),
                total_attempted: tally.attempted,
                correct_count: tally.correct,
                incorrect_count: tally.attempted - tally.correct,
                accuracy_percent: question_accuracy(tally.correct, tally.attempted),
            }
        })
        .collect();
    stats.sort_by_key(|s| s.qno);

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accuracy_zero_when_unattempted() {
        assert_eq!(question_accuracy(0, 0), 0.0);
    }

    #[test]
    fn accuracy_rounds_to_two_decimals() {
        assert_eq!(question_accuracy(1, 2), 50.0);
        assert_eq!(question_accuracy(1, 3), 33.33);
        assert_eq!(question_accuracy(2, 3), 66.67);
        assert_eq!(question_accuracy(3, 3), 100.0);
    }

    #[test]
    fn accuracy_stays_within_bounds() {
        for correct in 0..=10_u32 {
            for attempted in correct..=10_u32 {
                let acc = question_accuracy(correct, attempted);
                assert!((0.0..=100.0).contains(&acc), "accuracy {} out of bounds", acc);
            }
        }
    }
}
