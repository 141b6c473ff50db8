use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 2-decimal rounding used for percentages throughout:
/// `Int(100*x + 0.5) / 100`
pub fn round_off_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ScoreError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// The single correct option label per question number for one exam set.
/// Always passed in as an explicit snapshot; the engine never reaches out to
/// shared state for it, so re-scoring stays reproducible.
#[derive(Debug, Clone, Default)]
pub struct AnswerKey {
    entries: BTreeMap<u32, String>,
}

impl AnswerKey {
    pub fn new(entries: BTreeMap<u32, String>) -> Self {
        Self { entries }
    }

    pub fn total_questions(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn correct_option(&self, qno: u32) -> Option<&str> {
        self.entries.get(&qno).map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        self.entries.iter().map(|(q, o)| (*q, o.as_str()))
    }

    /// Parse the stored `{"1": "B", ...}` JSON column. String keys come from
    /// the wire/storage format; non-numeric keys are a structural error.
    pub fn from_json(raw: &serde_json::Value) -> Result<Self, ScoreError> {
        let Some(obj) = raw.as_object() else {
            return Err(ScoreError::new(
                "malformed_answer_key",
                "answer key must be an object of qno -> option",
            ));
        };
        let mut entries = BTreeMap::new();
        for (k, v) in obj {
            let Ok(qno) = k.parse::<u32>() else {
                return Err(ScoreError::new(
                    "malformed_answer_key",
                    format!("answer key has non-numeric question number: {}", k),
                ));
            };
            let Some(opt) = v.as_str().filter(|s| !s.trim().is_empty()) else {
                return Err(ScoreError::new(
                    "malformed_answer_key",
                    format!("answer key entry for question {} must be a non-empty string", qno),
                ));
            };
            entries.insert(qno, opt.to_string());
        }
        Ok(Self { entries })
    }
}

/// One authored question of an exam set, as stored in the `questions` JSON
/// column: `[{qno, question, options: {label: text}}]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub qno: u32,
    pub question: String,
    pub options: BTreeMap<String, String>,
}

/// Invariants enforced when a set is authored: qnos unique, the answer key
/// and the question sequence cover exactly the same qnos, every question has
/// four options, and each correct label is one of that question's options.
/// A question the key cannot score is flagged here, never skipped later.
pub fn validate_set(questions: &[Question], key: &AnswerKey) -> Result<(), ScoreError> {
    let mut seen = std::collections::BTreeSet::new();
    for q in questions {
        if !seen.insert(q.qno) {
            return Err(ScoreError::new(
                "malformed_answer_key",
                format!("duplicate question number {} in question sequence", q.qno),
            ));
        }
        if q.options.len() != 4 {
            return Err(ScoreError::new(
                "malformed_answer_key",
                format!(
                    "question {} must have exactly four options, found {}",
                    q.qno,
                    q.options.len()
                ),
            ));
        }
        let Some(correct) = key.correct_option(q.qno) else {
            return Err(ScoreError::new(
                "malformed_answer_key",
                format!("question {} has no answer key entry", q.qno),
            ));
        };
        if !q.options.contains_key(correct) {
            return Err(ScoreError::new(
                "malformed_answer_key",
                format!(
                    "answer key names option '{}' which question {} does not offer",
                    correct, q.qno
                ),
            ));
        }
    }
    for (qno, _) in key.iter() {
        if !seen.contains(&qno) {
            return Err(ScoreError::new(
                "malformed_answer_key",
                format!("answer key references question {} which is not in the set", qno),
            ));
        }
    }
    Ok(())
}

/// Raw student answer data prior to scoring. The two entry paths converge on
/// the same outcome shape and percentage formula.
#[derive(Debug, Clone)]
pub enum Submission {
    /// qno -> submitted option; None for a blank/unanswered bubble (OMR path).
    PerQuestion(BTreeMap<u32, Option<String>>),
    /// Pre-aggregated counts from manual entry.
    Tallied { correct: u32, wrong: u32 },
}

/// How the stored `score` is derived from the counts. The exam's negative
/// marking policy is configurable rather than hardcoded; `RawCorrect` is what
/// the portal has always used.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoringPolicy {
    RawCorrect,
    PerWrongPenalty(f64),
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        ScoringPolicy::RawCorrect
    }
}

impl ScoringPolicy {
    pub fn score_for(&self, correct: u32, wrong: u32) -> f64 {
        match self {
            ScoringPolicy::RawCorrect => correct as f64,
            ScoringPolicy::PerWrongPenalty(p) => correct as f64 - p * wrong as f64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredOutcome {
    pub correct: u32,
    pub wrong: u32,
    pub unanswered: u32,
    pub total_questions: u32,
    pub score: f64,
    pub percentage: f64,
}

/// Score one submission against an answer key snapshot. Pure; persistence is
/// the caller's concern.
///
/// Per-question path: every key entry is classified as correct, wrong, or
/// unanswered, so `correct + wrong + unanswered == total_questions` always
/// holds. A submitted question number with no key entry is rejected, not
/// skipped.
pub fn score(
    submission: &Submission,
    key: &AnswerKey,
    policy: ScoringPolicy,
) -> Result<ScoredOutcome, ScoreError> {
    let total = key.total_questions();

    let (correct, wrong, unanswered) = match submission {
        Submission::PerQuestion(answers) => {
            for qno in answers.keys() {
                if key.correct_option(*qno).is_none() {
                    return Err(ScoreError::new(
                        "malformed_answer_key",
                        format!(
                            "submitted question {} does not exist in the answer key",
                            qno
                        ),
                    )
                    .with_details(serde_json::json!({ "qno": qno })));
                }
            }

            let mut correct = 0_u32;
            let mut wrong = 0_u32;
            let mut unanswered = 0_u32;
            for (qno, correct_opt) in key.iter() {
                match answers.get(&qno).and_then(|a| a.as_deref()) {
                    Some(chosen) if chosen == correct_opt => correct += 1,
                    Some(_) => wrong += 1,
                    None => unanswered += 1,
                }
            }
            (correct, wrong, unanswered)
        }
        Submission::Tallied { correct, wrong } => {
            if *correct as u64 + *wrong as u64 > total as u64 {
                return Err(ScoreError::new(
                    "invalid_tally",
                    format!(
                        "correct ({}) + wrong ({}) exceeds the set's {} questions",
                        correct, wrong, total
                    ),
                )
                .with_details(serde_json::json!({
                    "correct": correct,
                    "wrong": wrong,
                    "totalQuestions": total
                })));
            }
            (*correct, *wrong, total - correct - wrong)
        }
    };

    let percentage = if total > 0 {
        round_off_2_decimals(100.0 * correct as f64 / total as f64)
    } else {
        0.0
    };

    Ok(ScoredOutcome {
        correct,
        wrong,
        unanswered,
        total_questions: total,
        score: policy.score_for(correct, wrong),
        percentage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_of(pairs: &[(u32, &str)]) -> AnswerKey {
        AnswerKey::new(
            pairs
                .iter()
                .map(|(q, o)| (*q, o.to_string()))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    fn answers_of(pairs: &[(u32, Option<&str>)]) -> Submission {
        Submission::PerQuestion(
            pairs
                .iter()
                .map(|(q, o)| (*q, o.map(|s| s.to_string())))
                .collect(),
        )
    }

    #[test]
    fn round_off_two_decimals() {
        assert_eq!(round_off_2_decimals(0.0), 0.0);
        assert_eq!(round_off_2_decimals(33.333333), 33.33);
        assert_eq!(round_off_2_decimals(66.666666), 66.67);
        assert_eq!(round_off_2_decimals(100.0), 100.0);
    }

    #[test]
    fn full_marks_and_partial_submission() {
        let key = key_of(&[(1, "B"), (2, "C")]);

        let a = score(
            &answers_of(&[(1, Some("B")), (2, Some("C"))]),
            &key,
            ScoringPolicy::RawCorrect,
        )
        .expect("score student A");
        assert_eq!((a.correct, a.wrong, a.unanswered), (2, 0, 0));
        assert_eq!(a.score, 2.0);
        assert_eq!(a.percentage, 100.0);

        let b = score(
            &answers_of(&[(1, Some("A")), (2, None)]),
            &key,
            ScoringPolicy::RawCorrect,
        )
        .expect("score student B");
        assert_eq!((b.correct, b.wrong, b.unanswered), (0, 1, 1));
        assert_eq!(b.percentage, 0.0);
    }

    #[test]
    fn questions_missing_from_submission_count_as_unanswered() {
        let key = key_of(&[(1, "A"), (2, "B"), (3, "C")]);
        let out = score(
            &answers_of(&[(2, Some("B"))]),
            &key,
            ScoringPolicy::RawCorrect,
        )
        .expect("score");
        assert_eq!((out.correct, out.wrong, out.unanswered), (1, 0, 2));
        assert_eq!(
            out.correct + out.wrong + out.unanswered,
            out.total_questions
        );
    }

    #[test]
    fn submitted_qno_absent_from_key_is_rejected() {
        let key = key_of(&[(1, "A")]);
        let err = score(
            &answers_of(&[(1, Some("A")), (9, Some("B"))]),
            &key,
            ScoringPolicy::RawCorrect,
        )
        .expect_err("must reject");
        assert_eq!(err.code, "malformed_answer_key");
    }

    #[test]
    fn tally_path_matches_per_question_shape() {
        let key = key_of(&[(1, "A"), (2, "B"), (3, "C"), (4, "D")]);
        let tallied = score(
            &Submission::Tallied {
                correct: 3,
                wrong: 0,
            },
            &key,
            ScoringPolicy::RawCorrect,
        )
        .expect("tally");
        assert_eq!((tallied.correct, tallied.wrong, tallied.unanswered), (3, 0, 1));
        assert_eq!(tallied.percentage, 75.0);
    }

    #[test]
    fn tally_exceeding_question_count_is_rejected() {
        let key = key_of(&[(1, "A"), (2, "B")]);
        let err = score(
            &Submission::Tallied {
                correct: 2,
                wrong: 1,
            },
            &key,
            ScoringPolicy::RawCorrect,
        )
        .expect_err("must reject");
        assert_eq!(err.code, "invalid_tally");
    }

    #[test]
    fn scoring_is_deterministic_for_identical_inputs() {
        let key = key_of(&[(1, "B"), (2, "C"), (3, "D")]);
        let sub = answers_of(&[(1, Some("B")), (2, Some("A")), (3, None)]);
        let first = score(&sub, &key, ScoringPolicy::RawCorrect).expect("first");
        let second = score(&sub, &key, ScoringPolicy::RawCorrect).expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn penalty_policy_subtracts_per_wrong() {
        let key = key_of(&[(1, "A"), (2, "B"), (3, "C"), (4, "D")]);
        let out = score(
            &answers_of(&[
                (1, Some("A")),
                (2, Some("B")),
                (3, Some("A")),
                (4, Some("A")),
            ]),
            &key,
            ScoringPolicy::PerWrongPenalty(0.25),
        )
        .expect("score");
        assert_eq!((out.correct, out.wrong), (2, 2));
        assert_eq!(out.score, 1.5);
        // Percentage stays on the raw correct count regardless of policy.
        assert_eq!(out.percentage, 50.0);
    }

    fn question(qno: u32, labels: &[&str]) -> Question {
        Question {
            qno,
            question: format!("Question {}", qno),
            options: labels
                .iter()
                .map(|l| (l.to_string(), format!("option {}", l)))
                .collect(),
        }
    }

    #[test]
    fn validate_set_accepts_matching_key() {
        let questions = vec![
            question(1, &["A", "B", "C", "D"]),
            question(2, &["A", "B", "C", "D"]),
        ];
        let key = key_of(&[(1, "B"), (2, "C")]);
        assert!(validate_set(&questions, &key).is_ok());
    }

    #[test]
    fn validate_set_flags_question_without_key_entry() {
        let questions = vec![
            question(1, &["A", "B", "C", "D"]),
            question(2, &["A", "B", "C", "D"]),
        ];
        let key = key_of(&[(1, "B")]);
        let err = validate_set(&questions, &key).expect_err("must flag");
        assert_eq!(err.code, "malformed_answer_key");
        assert!(err.message.contains("no answer key entry"));
    }

    #[test]
    fn validate_set_flags_key_entry_without_question() {
        let questions = vec![question(1, &["A", "B", "C", "D"])];
        let key = key_of(&[(1, "A"), (5, "D")]);
        let err = validate_set(&questions, &key).expect_err("must flag");
        assert_eq!(err.code, "malformed_answer_key");
    }

    #[test]
    fn validate_set_flags_correct_label_outside_options() {
        let questions = vec![question(1, &["A", "B", "C", "D"])];
        let key = key_of(&[(1, "E")]);
        let err = validate_set(&questions, &key).expect_err("must flag");
        assert_eq!(err.code, "malformed_answer_key");
    }

    #[test]
    fn answer_key_json_rejects_non_numeric_qno() {
        let raw = serde_json::json!({ "1": "A", "two": "B" });
        let err = AnswerKey::from_json(&raw).expect_err("must reject");
        assert_eq!(err.code, "malformed_answer_key");
    }

    #[test]
    fn answer_key_json_parses_string_keys() {
        let raw = serde_json::json!({ "2": "C", "1": "B" });
        let key = AnswerKey::from_json(&raw).expect("parse");
        assert_eq!(key.total_questions(), 2);
        assert_eq!(key.correct_option(1), Some("B"));
        assert_eq!(key.correct_option(2), Some("C"));
    }
}
