use crate::engine::{
    self, Category, GradeRecord, GradeRow, SaveRecord, ScoreField,
};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{optional_iso_date, required_str, today, HandlerErr};
use crate::ipc::types::{AppState, GradebookSession, Request, RosterStudent};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::json;
use uuid::Uuid;

pub const GRADE_COLUMNS: &str = "evaluacion1, evaluacion2, evaluacion3, evaluacion4, \
     evaluacion5, evaluacion6, evaluacion7, evaluacion8, \
     practica1, practica2, practica3, practica4, parcial1, parcial2";

const GRADE_SET_CLAUSE: &str = "evaluacion1 = ?, evaluacion2 = ?, evaluacion3 = ?, \
     evaluacion4 = ?, evaluacion5 = ?, evaluacion6 = ?, evaluacion7 = ?, evaluacion8 = ?, \
     practica1 = ?, practica2 = ?, practica3 = ?, practica4 = ?, parcial1 = ?, parcial2 = ?";

/// Reads the 14 grade columns laid out in `GRADE_COLUMNS` order starting at
/// `offset`.
pub fn record_from_row(row: &Row, offset: usize) -> rusqlite::Result<GradeRecord> {
    let mut record = GradeRecord::default();
    for (i, field) in ScoreField::all().enumerate() {
        let v: Option<f64> = row.get(offset + i)?;
        record.set(field, v);
    }
    Ok(record)
}

fn record_values(record: &GradeRecord) -> Vec<Value> {
    ScoreField::all()
        .map(|field| match record.get(field) {
            Some(v) => Value::Real(v),
            None => Value::Null,
        })
        .collect()
}

pub struct CourseInfo {
    pub id: String,
    pub name: String,
    pub code: String,
    pub year: i64,
    pub cycle: String,
    pub status: String,
}

impl CourseInfo {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "name": self.name,
            "code": self.code,
            "year": self.year,
            "cycle": self.cycle,
            "status": self.status,
        })
    }
}

pub fn fetch_course_info(
    conn: &Connection,
    course_id: &str,
) -> Result<CourseInfo, HandlerErr> {
    let info = conn
        .query_row(
            "SELECT id, name, code, year, cycle, status FROM courses WHERE id = ?",
            [course_id],
            |row| {
                Ok(CourseInfo {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    code: row.get(2)?,
                    year: row.get(3)?,
                    cycle: row.get(4)?,
                    status: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    info.ok_or_else(|| HandlerErr {
        code: "not_found",
        message: "course not found".to_string(),
        details: None,
    })
}

pub fn load_roster(conn: &Connection, course_id: &str) -> Result<Vec<RosterStudent>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.first_name, s.last_name, s.dni
             FROM enrollments e
             JOIN students s ON s.id = e.student_id
             WHERE e.course_id = ?
             ORDER BY s.last_name, s.first_name",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    stmt.query_map([course_id], |row| {
        Ok(RosterStudent {
            id: row.get(0)?,
            first_name: row.get(1)?,
            last_name: row.get(2)?,
            dni: row.get(3)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

pub fn load_grade_rows(conn: &Connection, course_id: &str) -> Result<Vec<GradeRow>, HandlerErr> {
    let sql = format!(
        "SELECT student_id, {} FROM grade_records WHERE course_id = ? ORDER BY rowid",
        GRADE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    stmt.query_map([course_id], |row| {
        let student_id: String = row.get(0)?;
        let record = record_from_row(row, 1)?;
        Ok(GradeRow { student_id, record })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

/// Writes the payload in one transaction. Each record merges its defined
/// fields over whatever the store already holds for that (course, student);
/// stored fields the payload does not mention are left alone.
pub fn persist_save_records(
    conn: &Connection,
    records: &[SaveRecord],
) -> Result<usize, HandlerErr> {
    if records.is_empty() {
        return Ok(0);
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    let select_sql = format!(
        "SELECT id, {} FROM grade_records WHERE course_id = ? AND student_id = ?",
        GRADE_COLUMNS
    );
    let update_sql = format!(
        "UPDATE grade_records SET {}, evaluation_date = ?, updated_at = ? WHERE id = ?",
        GRADE_SET_CLAUSE
    );
    let insert_sql = format!(
        "INSERT INTO grade_records(id, course_id, student_id, {}, evaluation_date, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        GRADE_COLUMNS
    );

    let mut written = 0usize;
    for rec in records {
        let existing = tx
            .query_row(&select_sql, (&rec.course_id, &rec.student_id), |row| {
                let id: String = row.get(0)?;
                let record = record_from_row(row, 1)?;
                Ok((id, record))
            })
            .optional();
        let existing: Option<(String, GradeRecord)> = match existing {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.rollback();
                return Err(HandlerErr {
                    code: "db_query_failed",
                    message: e.to_string(),
                    details: None,
                });
            }
        };

        let date = rec.evaluation_date.format("%Y-%m-%d").to_string();
        let stamp = crate::ipc::helpers::now_ts();

        match existing {
            Some((record_id, mut stored)) => {
                stored.merge_defined(&rec.grades);
                let mut binds = record_values(&stored);
                binds.push(Value::Text(date));
                binds.push(Value::Text(stamp));
                binds.push(Value::Text(record_id));
                if let Err(e) = tx.execute(&update_sql, params_from_iter(binds)) {
                    let _ = tx.rollback();
                    return Err(HandlerErr {
                        code: "db_update_failed",
                        message: e.to_string(),
                        details: Some(json!({ "table": "grade_records" })),
                    });
                }
            }
            None => {
                let mut binds = vec![
                    Value::Text(Uuid::new_v4().to_string()),
                    Value::Text(rec.course_id.clone()),
                    Value::Text(rec.student_id.clone()),
                ];
                binds.extend(record_values(&rec.grades));
                binds.push(Value::Text(date));
                binds.push(Value::Text(stamp));
                if let Err(e) = tx.execute(&insert_sql, params_from_iter(binds)) {
                    let _ = tx.rollback();
                    return Err(HandlerErr {
                        code: "db_insert_failed",
                        message: e.to_string(),
                        details: Some(json!({ "table": "grade_records" })),
                    });
                }
            }
        }
        written += 1;
    }

    if let Err(e) = tx.commit() {
        return Err(HandlerErr {
            code: "db_commit_failed",
            message: e.to_string(),
            details: None,
        });
    }
    Ok(written)
}

fn averages_json(record: &GradeRecord) -> (serde_json::Value, Option<f64>) {
    let overall = engine::overall_average(record);
    let v = json!({
        "evaluaciones": engine::category_average(record, Category::Evaluaciones),
        "practicas": engine::category_average(record, Category::Practicas),
        "parciales": engine::category_average(record, Category::Parciales),
        "overall": overall,
    });
    (v, overall)
}

fn grades_json(record: &GradeRecord) -> serde_json::Value {
    let mut grades = serde_json::Map::new();
    for (field, value) in record.defined_fields() {
        grades.insert(field.name(), json!(value));
    }
    serde_json::Value::Object(grades)
}

fn student_row_json(session: &GradebookSession, student: &RosterStudent) -> serde_json::Value {
    let record = session
        .overlay
        .get(&student.id)
        .copied()
        .unwrap_or_default();
    let (averages, overall) = averages_json(&record);
    json!({
        "id": student.id,
        "firstName": student.first_name,
        "lastName": student.last_name,
        "dni": student.dni,
        "grades": grades_json(&record),
        "averages": averages,
        "status": engine::derive_status(overall).as_str(),
        "hasUnsavedChanges": engine::has_unsaved_changes(
            &session.overlay,
            &session.baseline,
            &student.id
        ),
    })
}

fn session_rows_json(session: &GradebookSession) -> Vec<serde_json::Value> {
    session
        .roster
        .iter()
        .map(|s| student_row_json(session, s))
        .collect()
}

fn unsaved_count(session: &GradebookSession) -> usize {
    session
        .roster
        .iter()
        .filter(|s| engine::has_unsaved_changes(&session.overlay, &session.baseline, &s.id))
        .count()
}

fn handle_gradebook_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let AppState { db, sessions, .. } = state;
    let Some(conn) = db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let course = match fetch_course_info(conn, &course_id) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    if course.status != "activo" {
        return err(
            &req.id,
            "conflict",
            "course is finalized; grades are read-only",
            Some(json!({ "status": course.status })),
        );
    }

    let roster = match load_roster(conn, &course_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let rows = match load_grade_rows(conn, &course_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let session = GradebookSession {
        course_id: course_id.clone(),
        roster,
        baseline: engine::flatten_baseline(&rows),
        overlay: engine::seed_overlay(&rows),
    };
    let students = session_rows_json(&session);
    let unsaved = unsaved_count(&session);
    sessions.insert(course_id, session);

    ok(
        &req.id,
        json!({
            "course": course.to_json(),
            "students": students,
            "unsavedCount": unsaved,
        }),
    )
}

fn handle_gradebook_close(state: &mut AppState, req: &Request) -> serde_json::Value {
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let closed = state.sessions.remove(&course_id).is_some();
    ok(&req.id, json!({ "closed": closed }))
}

fn handle_gradebook_edit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let field_name = match required_str(req, "field") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    // The raw cell text; numbers are accepted and treated as their text form,
    // null clears.
    let raw = match req.params.get("value") {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        Some(_) => {
            return err(&req.id, "bad_params", "value must be a string", None);
        }
    };

    let Some(field) = ScoreField::parse(&field_name) else {
        return err(
            &req.id,
            "bad_params",
            "unknown grade field",
            Some(json!({ "field": field_name })),
        );
    };

    let Some(session) = state.sessions.get_mut(&course_id) else {
        return err(&req.id, "no_session", "open the gradebook first", None);
    };
    let Some(student) = session
        .roster
        .iter()
        .find(|s| s.id == student_id)
        .cloned()
    else {
        return err(&req.id, "not_found", "student not in course roster", None);
    };

    let applied = engine::apply_edit(&mut session.overlay, &student_id, field, &raw);

    ok(
        &req.id,
        json!({
            "applied": applied,
            "student": student_row_json(session, &student),
            "unsavedCount": unsaved_count(session),
        }),
    )
}

fn handle_gradebook_save_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let evaluation_date = match optional_iso_date(req, "evaluationDate") {
        Ok(v) => v.unwrap_or_else(today),
        Err(resp) => return resp,
    };

    let AppState { db, sessions, .. } = state;
    let Some(conn) = db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(session) = sessions.get_mut(&course_id) else {
        return err(&req.id, "no_session", "open the gradebook first", None);
    };
    let Some(student) = session
        .roster
        .iter()
        .find(|s| s.id == student_id)
        .cloned()
    else {
        return err(&req.id, "not_found", "student not in course roster", None);
    };

    let subset = vec![student_id.clone()];
    let payload = engine::build_bulk_save_payload(
        &session.overlay,
        &session.baseline,
        &course_id,
        evaluation_date,
        Some(&subset),
    );

    let saved = match persist_save_records(conn, &payload) {
        Ok(n) => n,
        Err(e) => return e.response(&req.id),
    };

    if saved > 0 {
        let rows = match load_grade_rows(conn, &course_id) {
            Ok(v) => v,
            Err(e) => return e.response(&req.id),
        };
        session.baseline = engine::flatten_baseline(&rows);
        let fresh = engine::seed_overlay(&rows);
        if let Some(rec) = fresh.get(&student_id) {
            session.overlay.insert(student_id.clone(), *rec);
        }
    }

    ok(
        &req.id,
        json!({
            "savedCount": saved,
            "evaluationDate": evaluation_date.format("%Y-%m-%d").to_string(),
            "student": student_row_json(session, &student),
            "unsavedCount": unsaved_count(session),
        }),
    )
}

fn handle_gradebook_save_all(state: &mut AppState, req: &Request) -> serde_json::Value {
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let evaluation_date = match optional_iso_date(req, "evaluationDate") {
        Ok(v) => v.unwrap_or_else(today),
        Err(resp) => return resp,
    };

    let AppState { db, sessions, .. } = state;
    let Some(conn) = db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(session) = sessions.get_mut(&course_id) else {
        return err(&req.id, "no_session", "open the gradebook first", None);
    };

    let payload = engine::build_bulk_save_payload(
        &session.overlay,
        &session.baseline,
        &course_id,
        evaluation_date,
        None,
    );

    let saved = match persist_save_records(conn, &payload) {
        Ok(n) => n,
        Err(e) => return e.response(&req.id),
    };

    if saved > 0 {
        let rows = match load_grade_rows(conn, &course_id) {
            Ok(v) => v,
            Err(e) => return e.response(&req.id),
        };
        session.baseline = engine::flatten_baseline(&rows);
        session.overlay = engine::seed_overlay(&rows);
    }

    ok(
        &req.id,
        json!({
            "savedCount": saved,
            "evaluationDate": evaluation_date.format("%Y-%m-%d").to_string(),
            "students": session_rows_json(session),
            "unsavedCount": unsaved_count(session),
        }),
    )
}

fn handle_gradebook_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let course = match fetch_course_info(conn, &course_id) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let roster = match load_roster(conn, &course_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let rows = match load_grade_rows(conn, &course_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let baseline = engine::flatten_baseline(&rows);

    let mut students = Vec::with_capacity(roster.len());
    let mut eval_avgs = Vec::with_capacity(roster.len());
    let mut prac_avgs = Vec::with_capacity(roster.len());
    let mut parc_avgs = Vec::with_capacity(roster.len());
    let mut overall_avgs = Vec::with_capacity(roster.len());
    let mut aprobados = 0usize;
    let mut desaprobados = 0usize;
    let mut sin_nota = 0usize;

    for student in &roster {
        let record = baseline.get(&student.id).copied().unwrap_or_default();
        let (averages, overall) = averages_json(&record);
        let status = engine::derive_status(overall);
        match status {
            engine::GradeStatus::Aprobado => aprobados += 1,
            engine::GradeStatus::Desaprobado => desaprobados += 1,
            engine::GradeStatus::SinNota => sin_nota += 1,
        }
        eval_avgs.push(engine::category_average(&record, Category::Evaluaciones));
        prac_avgs.push(engine::category_average(&record, Category::Practicas));
        parc_avgs.push(engine::category_average(&record, Category::Parciales));
        overall_avgs.push(overall);
        students.push(json!({
            "id": student.id,
            "firstName": student.first_name,
            "lastName": student.last_name,
            "dni": student.dni,
            "averages": averages,
            "status": status.as_str(),
        }));
    }

    ok(
        &req.id,
        json!({
            "course": course.to_json(),
            "students": students,
            "courseAverages": {
                "evaluaciones": engine::course_average(eval_avgs),
                "practicas": engine::course_average(prac_avgs),
                "parciales": engine::course_average(parc_avgs),
                "overall": engine::course_average(overall_avgs),
            },
            "counts": {
                "total": roster.len(),
                "aprobados": aprobados,
                "desaprobados": desaprobados,
                "sinNota": sin_nota,
            },
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "gradebook.open" => Some(handle_gradebook_open(state, req)),
        "gradebook.close" => Some(handle_gradebook_close(state, req)),
        "gradebook.edit" => Some(handle_gradebook_edit(state, req)),
        "gradebook.saveStudent" => Some(handle_gradebook_save_student(state, req)),
        "gradebook.saveAll" => Some(handle_gradebook_save_all(state, req)),
        "gradebook.summary" => Some(handle_gradebook_summary(state, req)),
        _ => None,
    }
}
