use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{now_ts, required_str, today_iso};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::json;
use uuid::Uuid;

const STATUS_ACTIVE: &str = "activo";
const STATUS_FINISHED: &str = "finalizado";

fn validate_status(status: &str) -> bool {
    matches!(status, STATUS_ACTIVE | STATUS_FINISHED)
}

struct CourseRow {
    id: String,
    name: String,
    code: String,
    year: i64,
    cycle: String,
    status: String,
    teacher_id: Option<String>,
}

impl CourseRow {
    fn from_row(row: &Row) -> rusqlite::Result<CourseRow> {
        Ok(CourseRow {
            id: row.get(0)?,
            name: row.get(1)?,
            code: row.get(2)?,
            year: row.get(3)?,
            cycle: row.get(4)?,
            status: row.get(5)?,
            teacher_id: row.get(6)?,
        })
    }

    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "name": self.name,
            "code": self.code,
            "year": self.year,
            "cycle": self.cycle,
            "status": self.status,
            "teacherId": self.teacher_id,
        })
    }
}

fn fetch_course(conn: &Connection, course_id: &str) -> rusqlite::Result<Option<CourseRow>> {
    conn.query_row(
        "SELECT id, name, code, year, cycle, status, teacher_id
         FROM courses WHERE id = ?",
        [course_id],
        CourseRow::from_row,
    )
    .optional()
}

fn code_taken(conn: &Connection, code: &str, exclude_id: Option<&str>) -> rusqlite::Result<bool> {
    let hit: Option<i64> = match exclude_id {
        Some(id) => conn
            .query_row(
                "SELECT 1 FROM courses WHERE code = ? AND id != ?",
                (code, id),
                |r| r.get(0),
            )
            .optional()?,
        None => conn
            .query_row("SELECT 1 FROM courses WHERE code = ?", [code], |r| r.get(0))
            .optional()?,
    };
    Ok(hit.is_some())
}

fn teacher_exists(conn: &Connection, teacher_id: &str) -> rusqlite::Result<bool> {
    let hit: Option<i64> = conn
        .query_row("SELECT 1 FROM teachers WHERE id = ?", [teacher_id], |r| {
            r.get(0)
        })
        .optional()?;
    Ok(hit.is_some())
}

fn handle_courses_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "courses": [] }));
    };

    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();

    if let Some(year) = req.params.get("year").and_then(|v| v.as_i64()) {
        clauses.push("c.year = ?");
        binds.push(Value::Integer(year));
    }
    if let Some(cycle) = req.params.get("cycle").and_then(|v| v.as_str()) {
        let cycle = cycle.trim();
        if !cycle.is_empty() {
            clauses.push("c.cycle = ?");
            binds.push(Value::Text(cycle.to_string()));
        }
    }
    if let Some(status) = req.params.get("status").and_then(|v| v.as_str()) {
        let status = status.trim().to_ascii_lowercase();
        if !validate_status(&status) {
            return err(
                &req.id,
                "bad_params",
                "status must be one of: activo, finalizado",
                Some(json!({ "status": status })),
            );
        }
        clauses.push("c.status = ?");
        binds.push(Value::Text(status));
    }
    if let Some(teacher_id) = req.params.get("teacherId").and_then(|v| v.as_str()) {
        clauses.push("c.teacher_id = ?");
        binds.push(Value::Text(teacher_id.to_string()));
    }
    if let Some(search) = req.params.get("search").and_then(|v| v.as_str()) {
        let term = search.trim();
        if !term.is_empty() {
            clauses.push("(c.name LIKE ? OR c.code LIKE ?)");
            let pattern = format!("%{}%", term);
            binds.push(Value::Text(pattern.clone()));
            binds.push(Value::Text(pattern));
        }
    }

    let mut sql = String::from(
        "SELECT c.id, c.name, c.code, c.year, c.cycle, c.status, c.teacher_id,
           t.first_name, t.last_name,
           (SELECT COUNT(*) FROM enrollments e WHERE e.course_id = c.id) AS student_count
         FROM courses c
         LEFT JOIN teachers t ON t.id = c.teacher_id",
    );
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY c.year DESC, c.cycle, c.name");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(binds), |row| {
            let course = CourseRow::from_row(row)?;
            let teacher_first: Option<String> = row.get(7)?;
            let teacher_last: Option<String> = row.get(8)?;
            let student_count: i64 = row.get(9)?;
            let teacher_name = match (teacher_last, teacher_first) {
                (Some(last), Some(first)) => Some(format!("{}, {}", last, first)),
                _ => None,
            };
            let mut v = course.to_json();
            v["teacherName"] = json!(teacher_name);
            v["studentCount"] = json!(student_count);
            Ok(v)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(courses) => ok(&req.id, json!({ "courses": courses })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_courses_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let code = match required_str(req, "code") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let year = match req.params.get("year").and_then(|v| v.as_i64()) {
        Some(v) if v > 0 => v,
        _ => return err(&req.id, "bad_params", "missing/invalid year", None),
    };
    let cycle = match required_str(req, "cycle") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let status = req
        .params
        .get("status")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_ascii_lowercase())
        .unwrap_or_else(|| STATUS_ACTIVE.to_string());
    if !validate_status(&status) {
        return err(
            &req.id,
            "bad_params",
            "status must be one of: activo, finalizado",
            Some(json!({ "status": status })),
        );
    }

    let teacher_id = req
        .params
        .get("teacherId")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    if let Some(tid) = &teacher_id {
        match teacher_exists(conn, tid) {
            Ok(true) => {}
            Ok(false) => return err(&req.id, "not_found", "teacher not found", None),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    match code_taken(conn, &code, None) {
        Ok(true) => {
            return err(
                &req.id,
                "conflict",
                "a course with this code already exists",
                Some(json!({ "code": code })),
            )
        }
        Ok(false) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let course = CourseRow {
        id: Uuid::new_v4().to_string(),
        name,
        code,
        year,
        cycle,
        status,
        teacher_id,
    };

    if let Err(e) = conn.execute(
        "INSERT INTO courses(id, name, code, year, cycle, status, teacher_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &course.id,
            &course.name,
            &course.code,
            course.year,
            &course.cycle,
            &course.status,
            &course.teacher_id,
            now_ts(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "courses" })),
        );
    }

    ok(&req.id, json!({ "course": course.to_json() }))
}

fn handle_courses_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let AppState { db, sessions, .. } = state;
    let Some(conn) = db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut course = match fetch_course(conn, &course_id) {
        Ok(Some(c)) => c,
        Ok(None) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if let Some(v) = req.params.get("name").and_then(|v| v.as_str()) {
        let v = v.trim();
        if v.is_empty() {
            return err(&req.id, "bad_params", "name must not be empty", None);
        }
        course.name = v.to_string();
    }
    if let Some(v) = req.params.get("code").and_then(|v| v.as_str()) {
        let v = v.trim();
        if v.is_empty() {
            return err(&req.id, "bad_params", "code must not be empty", None);
        }
        match code_taken(conn, v, Some(&course_id)) {
            Ok(true) => {
                return err(
                    &req.id,
                    "conflict",
                    "a course with this code already exists",
                    Some(json!({ "code": v })),
                )
            }
            Ok(false) => {}
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
        course.code = v.to_string();
    }
    if let Some(v) = req.params.get("year") {
        match v.as_i64() {
            Some(y) if y > 0 => course.year = y,
            _ => return err(&req.id, "bad_params", "invalid year", None),
        }
    }
    if let Some(v) = req.params.get("cycle").and_then(|v| v.as_str()) {
        let v = v.trim();
        if v.is_empty() {
            return err(&req.id, "bad_params", "cycle must not be empty", None);
        }
        course.cycle = v.to_string();
    }
    if let Some(v) = req.params.get("status").and_then(|v| v.as_str()) {
        let v = v.trim().to_ascii_lowercase();
        if !validate_status(&v) {
            return err(
                &req.id,
                "bad_params",
                "status must be one of: activo, finalizado",
                Some(json!({ "status": v })),
            );
        }
        course.status = v;
    }
    if let Some(v) = req.params.get("teacherId") {
        if v.is_null() {
            course.teacher_id = None;
        } else {
            let tid = v
                .as_str()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            let Some(tid) = tid else {
                return err(&req.id, "bad_params", "teacherId must be string or null", None);
            };
            match teacher_exists(conn, &tid) {
                Ok(true) => {}
                Ok(false) => return err(&req.id, "not_found", "teacher not found", None),
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            }
            course.teacher_id = Some(tid);
        }
    }

    if let Err(e) = conn.execute(
        "UPDATE courses
         SET name = ?, code = ?, year = ?, cycle = ?, status = ?, teacher_id = ?
         WHERE id = ?",
        (
            &course.name,
            &course.code,
            course.year,
            &course.cycle,
            &course.status,
            &course.teacher_id,
            &course_id,
        ),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "courses" })),
        );
    }

    // Finalizing ends any open editing session for the course.
    if course.status == STATUS_FINISHED {
        sessions.remove(&course_id);
    }

    ok(&req.id, json!({ "course": course.to_json() }))
}

fn handle_courses_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let AppState { db, sessions, .. } = state;
    let Some(conn) = db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    match fetch_course(conn, &course_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    if let Err(e) = tx.execute(
        "DELETE FROM grade_records WHERE course_id = ?",
        [&course_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grade_records" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM enrollments WHERE course_id = ?", [&course_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "enrollments" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM courses WHERE id = ?", [&course_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "courses" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    sessions.remove(&course_id);
    ok(&req.id, json!({ "ok": true }))
}

fn handle_roster_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match fetch_course(conn, &course_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let mut stmt = match conn.prepare(
        "SELECT s.id, s.first_name, s.last_name, s.dni, s.active, e.enrolled_at
         FROM enrollments e
         JOIN students s ON s.id = e.student_id
         WHERE e.course_id = ?
         ORDER BY s.last_name, s.first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&course_id], |row| {
            let id: String = row.get(0)?;
            let first_name: String = row.get(1)?;
            let last_name: String = row.get(2)?;
            let dni: String = row.get(3)?;
            let active: bool = row.get(4)?;
            let enrolled_at: String = row.get(5)?;
            Ok(json!({
                "id": id,
                "firstName": first_name,
                "lastName": last_name,
                "dni": dni,
                "active": active,
                "enrolledAt": enrolled_at,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_roster_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let AppState { db, sessions, .. } = state;
    let Some(conn) = db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let course = match fetch_course(conn, &course_id) {
        Ok(Some(c)) => c,
        Ok(None) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if course.status != STATUS_ACTIVE {
        return err(
            &req.id,
            "conflict",
            "course is finalized; roster is read-only",
            Some(json!({ "status": course.status })),
        );
    }

    let student_hit: Option<i64> = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if student_hit.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    let enrolled: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM enrollments WHERE course_id = ? AND student_id = ?",
            (&course_id, &student_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if enrolled.is_some() {
        return err(&req.id, "conflict", "student already enrolled", None);
    }

    if let Err(e) = conn.execute(
        "INSERT INTO enrollments(course_id, student_id, enrolled_at) VALUES(?, ?, ?)",
        (&course_id, &student_id, today_iso()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "enrollments" })),
        );
    }

    // A stale open gradebook would miss the new row; force a reopen.
    sessions.remove(&course_id);
    ok(&req.id, json!({ "ok": true }))
}

fn handle_roster_remove(state: &mut AppState, req: &Request) -> serde_json::Value {
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let AppState { db, sessions, .. } = state;
    let Some(conn) = db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let enrolled: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM enrollments WHERE course_id = ? AND student_id = ?",
            (&course_id, &student_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if enrolled.is_none() {
        return err(&req.id, "not_found", "enrollment not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Dropping the enrollment also drops the student's marks in this course.
    if let Err(e) = tx.execute(
        "DELETE FROM grade_records WHERE course_id = ? AND student_id = ?",
        (&course_id, &student_id),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grade_records" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM enrollments WHERE course_id = ? AND student_id = ?",
        (&course_id, &student_id),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "enrollments" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    sessions.remove(&course_id);
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.list" => Some(handle_courses_list(state, req)),
        "courses.create" => Some(handle_courses_create(state, req)),
        "courses.update" => Some(handle_courses_update(state, req)),
        "courses.delete" => Some(handle_courses_delete(state, req)),
        "roster.list" => Some(handle_roster_list(state, req)),
        "roster.add" => Some(handle_roster_add(state, req)),
        "roster.remove" => Some(handle_roster_remove(state, req)),
        _ => None,
    }
}
