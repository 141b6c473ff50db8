use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

fn handle_students_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let roll_number = match req.params.get("rollNumber").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing rollNumber", None),
    };
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    let class_name = match req.params.get("className").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing className", None),
    };
    let school = match req.params.get("school").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing school", None),
    };

    let student_id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO students(id, roll_number, name, class_name, school)
         VALUES(?, ?, ?, ?, ?)",
        (&student_id, &roll_number, &name, &class_name, &school),
    ) {
        Ok(_) => ok(&req.id, json!({ "studentId": student_id })),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            err(
                &req.id,
                "conflict",
                "roll number is already registered",
                Some(json!({ "rollNumber": roll_number })),
            )
        }
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let mut sql = String::from(
        "SELECT id, roll_number, name, class_name, school FROM students WHERE 1=1",
    );
    let mut binds: Vec<String> = Vec::new();
    if let Some(c) = &class_name {
        sql.push_str(" AND class_name = ?");
        binds.push(c.clone());
    }
    if let Some(s) = &school {
        sql.push_str(" AND school = ?");
        binds.push(s.clone());
    }
    sql.push_str(" ORDER BY roll_number");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "rollNumber": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "className": r.get::<_, String>(3)?,
                "school": r.get::<_, String>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.register" => Some(handle_students_register(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        _ => None,
    }
}
