use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_scholard");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn scholard");
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
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn expect_ok(value: &serde_json::Value, what: &str) -> serde_json::Value {
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        what,
        value
    );
    value.get("result").cloned().expect("result payload")
}

fn seed_workspace(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> (String, Vec<String>) {
    expect_ok(
        &request(
            stdin,
            reader,
            "s1",
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        ),
        "workspace.select",
    );
    let exam = expect_ok(
        &request(
            stdin,
            reader,
            "s2",
            "exams.create",
            json!({ "name": "Analysis Exam", "year": 2025, "questionCount": 2 }),
        ),
        "exams.create",
    );
    let exam_id = exam.get("examId").and_then(|v| v.as_str()).expect("examId");
    let set = expect_ok(
        &request(
            stdin,
            reader,
            "s3",
            "examSets.create",
            json!({
                "examId": exam_id,
                "className": "Class 5",
                "setName": "A",
                "questions": [
                    { "qno": 1, "question": "Q1", "options": {"A": "a", "B": "b", "C": "c", "D": "d"} },
                    { "qno": 2, "question": "Q2", "options": {"A": "a", "B": "b", "C": "c", "D": "d"} }
                ],
                "answerKey": { "1": "B", "2": "C" }
            }),
        ),
        "examSets.create",
    );
    let set_id = set
        .get("examSetId")
        .and_then(|v| v.as_str())
        .expect("examSetId")
        .to_string();

    let mut students = Vec::new();
    for (i, roll) in ["4001", "4002", "4003"].iter().enumerate() {
        let reg = expect_ok(
            &request(
                stdin,
                reader,
                &format!("s4-{}", i),
                "students.register",
                json!({
                    "rollNumber": roll,
                    "name": format!("Student {}", roll),
                    "className": "Class 5",
                    "school": "West School"
                }),
            ),
            "register",
        );
        students.push(
            reg.get("studentId")
                .and_then(|v| v.as_str())
                .expect("id")
                .to_string(),
        );
    }
    (set_id, students)
}

fn stat_for(stats: &serde_json::Value, qno: u64) -> serde_json::Value {
    stats
        .get("questions")
        .and_then(|v| v.as_array())
        .expect("questions array")
        .iter()
        .find(|q| q.get("qno").and_then(|v| v.as_u64()) == Some(qno))
        .unwrap_or_else(|| panic!("no stat for question {}", qno))
        .clone()
}

#[test]
fn per_question_stats_match_reference_scenario() {
    let workspace = temp_dir("scholard-analytics");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (set_id, students) = seed_workspace(&mut stdin, &mut reader, &workspace);

    // Student A: {1: B, 2: C}; student B: {1: A, 2: null}.
    expect_ok(
        &request(
            &mut stdin,
            &mut reader,
            "1",
            "submissions.submitAnswers",
            json!({
                "studentId": students[0],
                "examSetId": set_id,
                "answers": { "1": "B", "2": "C" }
            }),
        ),
        "submit A",
    );
    expect_ok(
        &request(
            &mut stdin,
            &mut reader,
            "2",
            "submissions.submitAnswers",
            json!({
                "studentId": students[1],
                "examSetId": set_id,
                "answers": { "1": "A", "2": null }
            }),
        ),
        "submit B",
    );

    let stats = expect_ok(
        &request(
            &mut stdin,
            &mut reader,
            "3",
            "analytics.questionStats",
            json!({ "examSetId": set_id }),
        ),
        "questionStats",
    );

    let q1 = stat_for(&stats, 1);
    assert_eq!(q1.get("totalAttempted").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(q1.get("correctCount").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(q1.get("incorrectCount").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(q1.get("accuracyPercent").and_then(|v| v.as_f64()), Some(50.0));
    assert_eq!(q1.get("correctOption").and_then(|v| v.as_str()), Some("B"));

    let q2 = stat_for(&stats, 2);
    assert_eq!(q2.get("totalAttempted").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(q2.get("correctCount").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(q2.get("incorrectCount").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(q2.get("accuracyPercent").and_then(|v| v.as_f64()), Some(100.0));

    // Ordered by qno ascending.
    let qnos: Vec<u64> = stats
        .get("questions")
        .and_then(|v| v.as_array())
        .expect("questions")
        .iter()
        .map(|q| q.get("qno").and_then(|v| v.as_u64()).expect("qno"))
        .collect();
    assert_eq!(qnos, vec![1, 2]);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn unattempted_set_reports_zero_accuracy_not_an_error() {
    let workspace = temp_dir("scholard-empty-stats");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (set_id, _) = seed_workspace(&mut stdin, &mut reader, &workspace);

    let stats = expect_ok(
        &request(
            &mut stdin,
            &mut reader,
            "1",
            "analytics.questionStats",
            json!({ "examSetId": set_id }),
        ),
        "questionStats on empty cohort",
    );
    let questions = stats
        .get("questions")
        .and_then(|v| v.as_array())
        .expect("questions");
    assert_eq!(questions.len(), 2);
    for q in questions {
        assert_eq!(q.get("totalAttempted").and_then(|v| v.as_u64()), Some(0));
        assert_eq!(q.get("accuracyPercent").and_then(|v| v.as_f64()), Some(0.0));
    }

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn tally_submissions_do_not_enter_question_stats() {
    let workspace = temp_dir("scholard-tally-stats");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (set_id, students) = seed_workspace(&mut stdin, &mut reader, &workspace);

    expect_ok(
        &request(
            &mut stdin,
            &mut reader,
            "1",
            "submissions.submitAnswers",
            json!({
                "studentId": students[0],
                "examSetId": set_id,
                "answers": { "1": "B", "2": "C" }
            }),
        ),
        "submit per-question",
    );
    // Manual tally for another student carries no per-question data.
    expect_ok(
        &request(
            &mut stdin,
            &mut reader,
            "2",
            "submissions.submitTally",
            json!({
                "studentId": students[1],
                "examSetId": set_id,
                "correct": 2,
                "wrong": 0
            }),
        ),
        "submit tally",
    );

    let stats = expect_ok(
        &request(
            &mut stdin,
            &mut reader,
            "3",
            "analytics.questionStats",
            json!({ "examSetId": set_id }),
        ),
        "questionStats",
    );
    let q1 = stat_for(&stats, 1);
    assert_eq!(q1.get("totalAttempted").and_then(|v| v.as_u64()), Some(1));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn stats_reflect_corrected_submissions_immediately() {
    let workspace = temp_dir("scholard-fresh-stats");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (set_id, students) = seed_workspace(&mut stdin, &mut reader, &workspace);

    expect_ok(
        &request(
            &mut stdin,
            &mut reader,
            "1",
            "submissions.submitAnswers",
            json!({
                "studentId": students[0],
                "examSetId": set_id,
                "answers": { "1": "A", "2": "A" }
            }),
        ),
        "initial submit",
    );
    let before = expect_ok(
        &request(
            &mut stdin,
            &mut reader,
            "2",
            "analytics.questionStats",
            json!({ "examSetId": set_id }),
        ),
        "stats before",
    );
    assert_eq!(
        stat_for(&before, 1).get("correctCount").and_then(|v| v.as_u64()),
        Some(0)
    );

    // Corrected OMR read; stats are recomputed, never cached stale.
    expect_ok(
        &request(
            &mut stdin,
            &mut reader,
            "3",
            "submissions.submitAnswers",
            json!({
                "studentId": students[0],
                "examSetId": set_id,
                "answers": { "1": "B", "2": "C" }
            }),
        ),
        "corrected submit",
    );
    let after = expect_ok(
        &request(
            &mut stdin,
            &mut reader,
            "4",
            "analytics.questionStats",
            json!({ "examSetId": set_id }),
        ),
        "stats after",
    );
    assert_eq!(
        stat_for(&after, 1).get("correctCount").and_then(|v| v.as_u64()),
        Some(1)
    );
    assert_eq!(
        stat_for(&after, 1).get("totalAttempted").and_then(|v| v.as_u64()),
        Some(1)
    );

    drop(stdin);
    let _ = child.wait();
}
