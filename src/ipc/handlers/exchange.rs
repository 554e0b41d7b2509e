use crate::engine::{self, ScoreField};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;

use super::gradebook::{fetch_course_info, load_grade_rows, load_roster};

fn normalize_key(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}

fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '"' {
            if in_quotes && i + 1 < chars.len() && chars[i + 1] == '"' {
                buf.push('"');
                i += 2;
                continue;
            }
            in_quotes = !in_quotes;
            i += 1;
            continue;
        }
        if ch == ',' && !in_quotes {
            out.push(buf);
            buf = String::new();
            i += 1;
            continue;
        }
        buf.push(ch);
        i += 1;
    }
    out.push(buf);
    out
}

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn write_text_file(path: &str, contents: &str) -> Result<(), HandlerErr> {
    let out = PathBuf::from(path);
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent).map_err(|e| HandlerErr {
            code: "export_failed",
            message: e.to_string(),
            details: Some(json!({ "path": path })),
        })?;
    }
    std::fs::write(&out, contents).map_err(|e| HandlerErr {
        code: "export_failed",
        message: e.to_string(),
        details: Some(json!({ "path": path })),
    })?;
    Ok(())
}

fn template_header() -> String {
    let mut cols: Vec<String> = vec!["DNI".into(), "NOMBRE".into(), "APELLIDO".into()];
    for field in ScoreField::all() {
        cols.push(field.name().to_uppercase());
    }
    cols.join(",")
}

/// Blank fill-in sheet: one row per enrolled student, grade cells empty.
fn handle_export_template(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let out_path = match required_str(req, "outPath") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    if let Err(e) = fetch_course_info(conn, &course_id) {
        return e.response(&req.id);
    }
    let roster = match load_roster(conn, &course_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let empty_cells = ",".repeat(ScoreField::all().count());
    let mut csv = template_header();
    csv.push('\n');
    let mut rows_exported = 0usize;
    for student in &roster {
        rows_exported += 1;
        csv.push_str(&format!(
            "{},{},{}{}\n",
            csv_quote(&student.dni),
            csv_quote(&student.first_name),
            csv_quote(&student.last_name),
            empty_cells
        ));
    }

    if let Err(e) = write_text_file(&out_path, &csv) {
        return e.response(&req.id);
    }
    ok(
        &req.id,
        json!({
            "ok": true,
            "rowsExported": rows_exported,
            "path": out_path
        }),
    )
}

/// Reads a filled template into the open gradebook session. Cells land in the
/// editing overlay through the same format/validate pipeline as manual edits;
/// nothing touches the store until a save. Blank cells are skipped, they do
/// not clear existing marks.
fn handle_import_grades(state: &mut AppState, req: &Request) -> serde_json::Value {
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let in_path = match required_str(req, "inPath") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let Some(session) = state.sessions.get_mut(&course_id) else {
        return err(&req.id, "no_session", "open the gradebook first", None);
    };

    let text = match std::fs::read_to_string(&in_path) {
        Ok(t) => t,
        Err(e) => {
            return err(
                &req.id,
                "parse_failed",
                e.to_string(),
                Some(json!({ "path": in_path })),
            )
        }
    };

    let mut lines = text.lines().enumerate();
    let Some((_, header_line)) = lines.next() else {
        return err(&req.id, "parse_failed", "file is empty", None);
    };

    let mut dni_col: Option<usize> = None;
    let mut grade_cols: Vec<(usize, ScoreField)> = Vec::new();
    for (i, name) in parse_csv_record(header_line).iter().enumerate() {
        let key = normalize_key(name);
        if key == "dni" {
            dni_col = Some(i);
        } else if let Some(field) = ScoreField::parse(&key) {
            grade_cols.push((i, field));
        }
        // Name columns and anything else are display-only; matching is by DNI.
    }
    let Some(dni_col) = dni_col else {
        return err(&req.id, "parse_failed", "missing DNI column", None);
    };
    if grade_cols.is_empty() {
        return err(&req.id, "parse_failed", "no grade columns found", None);
    }

    let by_dni: HashMap<&str, &str> = session
        .roster
        .iter()
        .map(|s| (s.dni.as_str(), s.id.as_str()))
        .collect();

    let mut applied_cells = 0usize;
    let mut errors: Vec<serde_json::Value> = Vec::new();

    for (idx, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        let line_no = idx + 1;
        let cells = parse_csv_record(line);

        let dni = cells
            .get(dni_col)
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if dni.is_empty() {
            errors.push(json!({
                "line": line_no,
                "code": "bad_params",
                "message": "row has no DNI",
            }));
            continue;
        }
        let Some(student_id) = by_dni.get(dni.as_str()).map(|s| s.to_string()) else {
            errors.push(json!({
                "line": line_no,
                "dni": dni,
                "code": "not_found",
                "message": "no enrolled student with this DNI",
            }));
            continue;
        };

        for (col, field) in &grade_cols {
            let raw = cells.get(*col).map(|s| s.trim()).unwrap_or("");
            if raw.is_empty() {
                continue;
            }
            if engine::apply_edit(&mut session.overlay, &student_id, *field, raw) {
                applied_cells += 1;
            } else {
                errors.push(json!({
                    "line": line_no,
                    "dni": dni,
                    "field": field.name(),
                    "code": "invalid_score",
                    "message": format!("value {:?} is not a mark between 0 and 20", raw),
                }));
            }
        }
    }

    let unsaved = session
        .roster
        .iter()
        .filter(|s| engine::has_unsaved_changes(&session.overlay, &session.baseline, &s.id))
        .count();

    ok(
        &req.id,
        json!({
            "appliedCells": applied_cells,
            "errors": errors,
            "unsavedCount": unsaved,
        }),
    )
}

/// Final report sheet from the store, one row per student.
fn handle_export_results(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let out_path = match required_str(req, "outPath") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    if let Err(e) = fetch_course_info(conn, &course_id) {
        return e.response(&req.id);
    }
    let roster = match load_roster(conn, &course_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let rows = match load_grade_rows(conn, &course_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let baseline = engine::flatten_baseline(&rows);

    let mut csv = String::from("N°,Apellidos y Nombres,Promedio General\n");
    let mut rows_exported = 0usize;
    for (i, student) in roster.iter().enumerate() {
        let record = baseline.get(&student.id).copied().unwrap_or_default();
        let average = engine::overall_average(&record)
            .map(|v| format!("{:.2}", v))
            .unwrap_or_default();
        rows_exported += 1;
        csv.push_str(&format!(
            "{},{},{}\n",
            i + 1,
            csv_quote(&format!("{}, {}", student.last_name, student.first_name)),
            average
        ));
    }

    if let Err(e) = write_text_file(&out_path, &csv) {
        return e.response(&req.id);
    }
    ok(
        &req.id,
        json!({
            "ok": true,
            "rowsExported": rows_exported,
            "path": out_path
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exchange.exportTemplate" => Some(handle_export_template(state, req)),
        "exchange.importGrades" => Some(handle_import_grades(state, req)),
        "exchange.exportResults" => Some(handle_export_results(state, req)),
        _ => None,
    }
}
