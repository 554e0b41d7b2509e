use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{now_ts, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::json;
use uuid::Uuid;

struct TeacherRow {
    id: String,
    first_name: String,
    last_name: String,
    dni: String,
    email: Option<String>,
    phone: Option<String>,
    active: bool,
}

impl TeacherRow {
    fn from_row(row: &Row) -> rusqlite::Result<TeacherRow> {
        Ok(TeacherRow {
            id: row.get(0)?,
            first_name: row.get(1)?,
            last_name: row.get(2)?,
            dni: row.get(3)?,
            email: row.get(4)?,
            phone: row.get(5)?,
            active: row.get(6)?,
        })
    }

    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "firstName": self.first_name,
            "lastName": self.last_name,
            "dni": self.dni,
            "email": self.email,
            "phone": self.phone,
            "active": self.active,
        })
    }
}

const TEACHER_COLUMNS: &str = "id, first_name, last_name, dni, email, phone, active";

fn fetch_teacher(conn: &Connection, teacher_id: &str) -> rusqlite::Result<Option<TeacherRow>> {
    conn.query_row(
        &format!("SELECT {} FROM teachers WHERE id = ?", TEACHER_COLUMNS),
        [teacher_id],
        TeacherRow::from_row,
    )
    .optional()
}

fn dni_taken(conn: &Connection, dni: &str, exclude_id: Option<&str>) -> rusqlite::Result<bool> {
    let hit: Option<i64> = match exclude_id {
        Some(id) => conn
            .query_row(
                "SELECT 1 FROM teachers WHERE dni = ? AND id != ?",
                (dni, id),
                |r| r.get(0),
            )
            .optional()?,
        None => conn
            .query_row("SELECT 1 FROM teachers WHERE dni = ?", [dni], |r| r.get(0))
            .optional()?,
    };
    Ok(hit.is_some())
}

/// Optional string param: absent keeps the current value, null or blank
/// clears it.
fn merge_opt_text(req: &Request, key: &str, current: &mut Option<String>) {
    if let Some(v) = req.params.get(key) {
        *current = v
            .as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
    }
}

fn handle_teachers_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "teachers": [] }));
    };

    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();

    if req
        .params
        .get("activeOnly")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        clauses.push("t.active = 1");
    }
    if let Some(search) = req.params.get("search").and_then(|v| v.as_str()) {
        let term = search.trim();
        if !term.is_empty() {
            clauses.push("(t.last_name LIKE ? OR t.first_name LIKE ? OR t.dni LIKE ?)");
            let pattern = format!("%{}%", term);
            binds.push(Value::Text(pattern.clone()));
            binds.push(Value::Text(pattern.clone()));
            binds.push(Value::Text(pattern));
        }
    }

    let mut sql = String::from(
        "SELECT t.id, t.first_name, t.last_name, t.dni, t.email, t.phone, t.active,
           (SELECT COUNT(*) FROM courses c WHERE c.teacher_id = t.id) AS course_count
         FROM teachers t",
    );
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY t.last_name, t.first_name");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(binds), |row| {
            let teacher = TeacherRow::from_row(row)?;
            let course_count: i64 = row.get(7)?;
            let mut v = teacher.to_json();
            v["courseCount"] = json!(course_count);
            Ok(v)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(teachers) => ok(&req.id, json!({ "teachers": teachers })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_teachers_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let dni = match required_str(req, "dni") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match dni_taken(conn, &dni, None) {
        Ok(true) => {
            return err(
                &req.id,
                "conflict",
                "a teacher with this dni already exists",
                Some(json!({ "dni": dni })),
            )
        }
        Ok(false) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let mut email = None;
    let mut phone = None;
    merge_opt_text(req, "email", &mut email);
    merge_opt_text(req, "phone", &mut phone);

    let teacher = TeacherRow {
        id: Uuid::new_v4().to_string(),
        first_name,
        last_name,
        dni,
        email,
        phone,
        active: true,
    };

    if let Err(e) = conn.execute(
        "INSERT INTO teachers(id, first_name, last_name, dni, email, phone, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &teacher.id,
            &teacher.first_name,
            &teacher.last_name,
            &teacher.dni,
            &teacher.email,
            &teacher.phone,
            teacher.active,
            now_ts(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "teachers" })),
        );
    }

    ok(&req.id, json!({ "teacher": teacher.to_json() }))
}

fn handle_teachers_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let mut teacher = match fetch_teacher(conn, &teacher_id) {
        Ok(Some(t)) => t,
        Ok(None) => return err(&req.id, "not_found", "teacher not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if let Some(v) = req.params.get("firstName").and_then(|v| v.as_str()) {
        let v = v.trim();
        if v.is_empty() {
            return err(&req.id, "bad_params", "firstName must not be empty", None);
        }
        teacher.first_name = v.to_string();
    }
    if let Some(v) = req.params.get("lastName").and_then(|v| v.as_str()) {
        let v = v.trim();
        if v.is_empty() {
            return err(&req.id, "bad_params", "lastName must not be empty", None);
        }
        teacher.last_name = v.to_string();
    }
    if let Some(v) = req.params.get("dni").and_then(|v| v.as_str()) {
        let v = v.trim();
        if v.is_empty() {
            return err(&req.id, "bad_params", "dni must not be empty", None);
        }
        match dni_taken(conn, v, Some(&teacher_id)) {
            Ok(true) => {
                return err(
                    &req.id,
                    "conflict",
                    "a teacher with this dni already exists",
                    Some(json!({ "dni": v })),
                )
            }
            Ok(false) => {}
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
        teacher.dni = v.to_string();
    }
    merge_opt_text(req, "email", &mut teacher.email);
    merge_opt_text(req, "phone", &mut teacher.phone);
    if let Some(v) = req.params.get("active").and_then(|v| v.as_bool()) {
        teacher.active = v;
    }

    if let Err(e) = conn.execute(
        "UPDATE teachers
         SET first_name = ?, last_name = ?, dni = ?, email = ?, phone = ?, active = ?
         WHERE id = ?",
        (
            &teacher.first_name,
            &teacher.last_name,
            &teacher.dni,
            &teacher.email,
            &teacher.phone,
            teacher.active,
            &teacher_id,
        ),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "teachers" })),
        );
    }

    ok(&req.id, json!({ "teacher": teacher.to_json() }))
}

fn handle_teachers_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match fetch_teacher(conn, &teacher_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "teacher not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let course_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM courses WHERE teacher_id = ?",
        [&teacher_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if course_count > 0 {
        return err(
            &req.id,
            "in_use",
            "teacher is assigned to courses",
            Some(json!({ "courseCount": course_count })),
        );
    }

    if let Err(e) = conn.execute("DELETE FROM teachers WHERE id = ?", [&teacher_id]) {
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "teachers" })),
        );
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.list" => Some(handle_teachers_list(state, req)),
        "teachers.create" => Some(handle_teachers_create(state, req)),
        "teachers.update" => Some(handle_teachers_update(state, req)),
        "teachers.delete" => Some(handle_teachers_delete(state, req)),
        _ => None,
    }
}
