mod test_support;

use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{request_ok, spawn_sidecar, temp_dir};

struct Seed {
    course_id: String,
    ana_id: String,
    bruno_id: String,
    carla_id: String,
}

fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Seed {
    let course = request_ok(
        stdin,
        reader,
        "seed-course",
        "courses.create",
        json!({ "name": "Comunicación 2B", "code": "COM-2B", "year": 2025, "cycle": "II" }),
    );
    let course_id = course
        .get("course")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("course id")
        .to_string();

    let mut ids = Vec::new();
    for (req_id, first, last, dni) in [
        ("seed-s1", "Ana", "Quispe", "40000001"),
        ("seed-s2", "Bruno", "Mamani", "40000002"),
        ("seed-s3", "Carla", "Torres", "40000003"),
    ] {
        let created = request_ok(
            stdin,
            reader,
            req_id,
            "students.create",
            json!({ "firstName": first, "lastName": last, "dni": dni }),
        );
        let student_id = created
            .get("student")
            .and_then(|v| v.get("id"))
            .and_then(|v| v.as_str())
            .expect("student id")
            .to_string();
        let _ = request_ok(
            stdin,
            reader,
            &format!("{}-enroll", req_id),
            "roster.add",
            json!({ "courseId": course_id, "studentId": student_id }),
        );
        ids.push(student_id);
    }
    let carla_id = ids.pop().expect("carla");
    let bruno_id = ids.pop().expect("bruno");
    let ana_id = ids.pop().expect("ana");
    Seed {
        course_id,
        ana_id,
        bruno_id,
        carla_id,
    }
}

fn edit(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    req_id: &str,
    course_id: &str,
    student_id: &str,
    field: &str,
    value: &str,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        req_id,
        "gradebook.edit",
        json!({
            "courseId": course_id,
            "studentId": student_id,
            "field": field,
            "value": value
        }),
    )
}

fn avg(result: &serde_json::Value, key: &str) -> Option<f64> {
    result
        .get("student")
        .and_then(|v| v.get("averages"))
        .and_then(|v| v.get(key))
        .and_then(|v| v.as_f64())
}

fn status(result: &serde_json::Value) -> Option<String> {
    result
        .get("student")
        .and_then(|v| v.get("status"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[test]
fn zero_marks_do_not_enter_category_averages() {
    let workspace = temp_dir("notas-rules-zero");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let s = seed(&mut stdin, &mut reader);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "gradebook.open",
        json!({ "courseId": s.course_id }),
    );

    let _ = edit(&mut stdin, &mut reader, "3", &s.course_id, &s.ana_id, "evaluacion1", "15");
    let with_zero = edit(&mut stdin, &mut reader, "4", &s.course_id, &s.ana_id, "evaluacion2", "0");

    // The zero is recorded in the cell but counts as absent for the average.
    assert_eq!(
        with_zero
            .get("student")
            .and_then(|v| v.get("grades"))
            .and_then(|v| v.get("evaluacion2"))
            .and_then(|v| v.as_f64()),
        Some(0.0)
    );
    assert_eq!(avg(&with_zero, "evaluaciones"), Some(15.0));
    assert_eq!(avg(&with_zero, "overall"), Some(15.0));
    assert_eq!(status(&with_zero).as_deref(), Some("APROBADO"));

    let replaced = edit(&mut stdin, &mut reader, "5", &s.course_id, &s.ana_id, "evaluacion2", "12");
    assert_eq!(avg(&replaced, "evaluaciones"), Some(13.5));
    assert_eq!(avg(&replaced, "overall"), Some(13.5));

    drop(stdin);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn weights_renormalize_over_present_categories() {
    let workspace = temp_dir("notas-rules-weights");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let s = seed(&mut stdin, &mut reader);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "gradebook.open",
        json!({ "courseId": s.course_id }),
    );

    // Parciales alone: the general average is the parcial average.
    let _ = edit(&mut stdin, &mut reader, "3", &s.course_id, &s.bruno_id, "parcial1", "15");
    let only_parciales = edit(&mut stdin, &mut reader, "4", &s.course_id, &s.bruno_id, "parcial2", "15");
    assert_eq!(avg(&only_parciales, "parciales"), Some(15.0));
    assert_eq!(avg(&only_parciales, "overall"), Some(15.0));

    // Practicas joins: (12*0.3 + 15*0.6) / 0.9.
    let two_cats = edit(&mut stdin, &mut reader, "5", &s.course_id, &s.bruno_id, "practica1", "12");
    assert_eq!(avg(&two_cats, "overall"), Some(14.0));

    // All three carry their full 10/30/60 weights.
    let three_cats = edit(&mut stdin, &mut reader, "6", &s.course_id, &s.bruno_id, "evaluacion1", "18");
    assert_eq!(avg(&three_cats, "evaluaciones"), Some(18.0));
    assert_eq!(avg(&three_cats, "overall"), Some(14.4));
    assert_eq!(status(&three_cats).as_deref(), Some("APROBADO"));

    drop(stdin);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn clamp_pad_reentry_and_clear_semantics() {
    let workspace = temp_dir("notas-rules-clamp");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let s = seed(&mut stdin, &mut reader);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "gradebook.open",
        json!({ "courseId": s.course_id }),
    );

    // Out-of-range keystrokes cap at 20.
    let clamped = edit(&mut stdin, &mut reader, "3", &s.course_id, &s.carla_id, "parcial1", "25");
    assert_eq!(
        clamped
            .get("student")
            .and_then(|v| v.get("grades"))
            .and_then(|v| v.get("parcial1"))
            .and_then(|v| v.as_f64()),
        Some(20.0)
    );
    assert_eq!(avg(&clamped, "overall"), Some(20.0));

    // Single digits normalize through the 0-padded form.
    let padded = edit(&mut stdin, &mut reader, "4", &s.course_id, &s.carla_id, "parcial1", "9");
    assert_eq!(
        padded
            .get("student")
            .and_then(|v| v.get("grades"))
            .and_then(|v| v.get("parcial1"))
            .and_then(|v| v.as_f64()),
        Some(9.0)
    );
    assert_eq!(status(&padded).as_deref(), Some("DESAPROBADO"));

    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "gradebook.saveAll",
        json!({ "courseId": s.course_id }),
    );
    assert_eq!(saved.get("savedCount").and_then(|v| v.as_u64()), Some(1));

    // Re-entering the stored value is not a pending change.
    let reentered = edit(&mut stdin, &mut reader, "6", &s.course_id, &s.carla_id, "parcial1", "9");
    assert_eq!(reentered.get("applied").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        reentered
            .get("student")
            .and_then(|v| v.get("hasUnsavedChanges"))
            .and_then(|v| v.as_bool()),
        Some(false)
    );
    assert_eq!(reentered.get("unsavedCount").and_then(|v| v.as_u64()), Some(0));

    // Clearing the cell empties the row in the session but never reaches the
    // store: cleared slots are invisible to the save diff.
    let cleared = edit(&mut stdin, &mut reader, "7", &s.course_id, &s.carla_id, "parcial1", "");
    assert_eq!(cleared.get("applied").and_then(|v| v.as_bool()), Some(true));
    let row = cleared.get("student").expect("student");
    assert!(row
        .get("grades")
        .and_then(|g| g.get("parcial1"))
        .is_none());
    assert_eq!(row.get("status").and_then(|v| v.as_str()), Some("SIN_NOTA"));
    assert_eq!(cleared.get("unsavedCount").and_then(|v| v.as_u64()), Some(0));

    let idle = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "gradebook.saveAll",
        json!({ "courseId": s.course_id }),
    );
    assert_eq!(idle.get("savedCount").and_then(|v| v.as_u64()), Some(0));

    let reopened = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "gradebook.open",
        json!({ "courseId": s.course_id }),
    );
    let carla_row = reopened
        .get("students")
        .and_then(|v| v.as_array())
        .and_then(|rows| {
            rows.iter()
                .find(|r| r.get("id").and_then(|v| v.as_str()) == Some(s.carla_id.as_str()))
        })
        .expect("carla row");
    assert_eq!(
        carla_row
            .get("grades")
            .and_then(|g| g.get("parcial1"))
            .and_then(|v| v.as_f64()),
        Some(9.0)
    );

    drop(stdin);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn summary_rolls_the_course_up_from_the_store() {
    let workspace = temp_dir("notas-rules-summary");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let s = seed(&mut stdin, &mut reader);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "gradebook.open",
        json!({ "courseId": s.course_id }),
    );
    let _ = edit(&mut stdin, &mut reader, "3", &s.course_id, &s.ana_id, "parcial1", "16");
    let _ = edit(&mut stdin, &mut reader, "4", &s.course_id, &s.bruno_id, "parcial1", "10");
    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "gradebook.saveAll",
        json!({ "courseId": s.course_id }),
    );
    assert_eq!(saved.get("savedCount").and_then(|v| v.as_u64()), Some(2));

    // The summary reads the store, not the session.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "gradebook.close",
        json!({ "courseId": s.course_id }),
    );
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "gradebook.summary",
        json!({ "courseId": s.course_id }),
    );

    let students = summary
        .get("students")
        .and_then(|v| v.as_array())
        .expect("students");
    assert_eq!(students.len(), 3);
    let status_of = |id: &str| {
        students
            .iter()
            .find(|r| r.get("id").and_then(|v| v.as_str()) == Some(id))
            .and_then(|r| r.get("status"))
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
    };
    assert_eq!(status_of(&s.ana_id).as_deref(), Some("APROBADO"));
    assert_eq!(status_of(&s.bruno_id).as_deref(), Some("DESAPROBADO"));
    assert_eq!(status_of(&s.carla_id).as_deref(), Some("SIN_NOTA"));

    let course_avgs = summary.get("courseAverages").expect("courseAverages");
    assert_eq!(
        course_avgs.get("parciales").and_then(|v| v.as_f64()),
        Some(13.0)
    );
    assert_eq!(
        course_avgs.get("overall").and_then(|v| v.as_f64()),
        Some(13.0)
    );
    assert!(course_avgs
        .get("evaluaciones")
        .map(|v| v.is_null())
        .unwrap_or(false));

    let counts = summary.get("counts").expect("counts");
    assert_eq!(counts.get("total").and_then(|v| v.as_u64()), Some(3));
    assert_eq!(counts.get("aprobados").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(counts.get("desaprobados").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(counts.get("sinNota").and_then(|v| v.as_u64()), Some(1));

    drop(stdin);
    let _ = std::fs::remove_dir_all(workspace);
}
