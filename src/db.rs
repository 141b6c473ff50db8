use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("scholard.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exams(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            year INTEGER NOT NULL,
            question_count INTEGER NOT NULL
        )",
        [],
    )?;

    // One class-level set of questions per (exam, class, set). Questions and
    // the answer key are stored as JSON text; the key/question invariants are
    // validated before insert, never on read.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_sets(
            id TEXT PRIMARY KEY,
            exam_id TEXT NOT NULL,
            class_name TEXT NOT NULL,
            set_name TEXT NOT NULL,
            questions TEXT NOT NULL,
            answer_key TEXT NOT NULL,
            UNIQUE(exam_id, class_name, set_name),
            FOREIGN KEY(exam_id) REFERENCES exams(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_sets_exam ON exam_sets(exam_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            roll_number TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            class_name TEXT NOT NULL,
            school TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_name)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_school ON students(school)",
        [],
    )?;

    // Raw answer data, one row per (student, set). kind is 'answers' for the
    // OMR per-question map or 'tally' for manual correct/wrong entry.
    // Re-submission overwrites the row via ON CONFLICT in the handlers.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS submissions(
            student_id TEXT NOT NULL,
            exam_set_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            answers TEXT,
            correct INTEGER,
            wrong INTEGER,
            submitted_at TEXT NOT NULL,
            PRIMARY KEY(student_id, exam_set_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(exam_set_id) REFERENCES exam_sets(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_submissions_set ON submissions(exam_set_id)",
        [],
    )?;

    // Derived scoring outcome. Written only by the scoring pipeline, whole-row
    // replaced on every recomputation; version increments on each write.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS results(
            student_id TEXT NOT NULL,
            exam_set_id TEXT NOT NULL,
            correct INTEGER NOT NULL,
            wrong INTEGER NOT NULL,
            unanswered INTEGER NOT NULL,
            score REAL NOT NULL,
            percentage REAL NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            computed_at TEXT NOT NULL,
            PRIMARY KEY(student_id, exam_set_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(exam_set_id) REFERENCES exam_sets(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_set ON results(exam_set_id)",
        [],
    )?;

    // Presence of a row is the single source of truth for eligibility.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS scholarship_marks(
            student_id TEXT PRIMARY KEY,
            marked_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    Ok(conn)
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
