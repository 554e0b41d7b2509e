use crate::ipc::error::{err, ok};
use crate::ipc::helpers::db_conn;
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn count_with_active(conn: &Connection, table: &str) -> rusqlite::Result<(i64, i64)> {
    let sql = format!("SELECT COUNT(*), SUM(active) FROM {}", table);
    conn.query_row(&sql, [], |row| {
        let total: i64 = row.get(0)?;
        let active: Option<i64> = row.get(1)?;
        Ok((total, active.unwrap_or(0)))
    })
}

fn handle_dashboard(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let (teachers_total, teachers_active) = match count_with_active(conn, "teachers") {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let (students_total, students_active) = match count_with_active(conn, "students") {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let courses = conn.query_row(
        "SELECT COUNT(*),
           SUM(CASE WHEN status = 'activo' THEN 1 ELSE 0 END),
           SUM(CASE WHEN status = 'finalizado' THEN 1 ELSE 0 END)
         FROM courses",
        [],
        |row| {
            let total: i64 = row.get(0)?;
            let active: Option<i64> = row.get(1)?;
            let finished: Option<i64> = row.get(2)?;
            Ok((total, active.unwrap_or(0), finished.unwrap_or(0)))
        },
    );
    let (courses_total, courses_active, courses_finished) = match courses {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let enrollments: i64 = match conn.query_row("SELECT COUNT(*) FROM enrollments", [], |r| r.get(0))
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT year, COUNT(*) FROM courses GROUP BY year ORDER BY year DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let by_year = stmt
        .query_map([], |row| {
            let year: i64 = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok(json!({ "year": year, "count": count }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let courses_by_year = match by_year {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "teachers": { "total": teachers_total, "active": teachers_active },
            "students": { "total": students_total, "active": students_active },
            "courses": {
                "total": courses_total,
                "activos": courses_active,
                "finalizados": courses_finished,
            },
            "enrollments": enrollments,
            "coursesByYear": courses_by_year,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.dashboard" => Some(handle_dashboard(state, req)),
        _ => None,
    }
}
