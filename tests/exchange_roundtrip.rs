mod test_support;

use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{error_code, request, request_ok, spawn_sidecar, temp_dir};

fn seed_pair(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
) -> (String, String, String) {
    let course = request_ok(
        stdin,
        reader,
        "seed-course",
        "courses.create",
        json!({ "name": "Ciencias 1A", "code": "CIE-1A", "year": 2025, "cycle": "I" }),
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
    let bruno_id = ids.pop().expect("bruno");
    let ana_id = ids.pop().expect("ana");
    (course_id, ana_id, bruno_id)
}

const TEMPLATE_HEADER: &str = "DNI,NOMBRE,APELLIDO,\
EVALUACION1,EVALUACION2,EVALUACION3,EVALUACION4,\
EVALUACION5,EVALUACION6,EVALUACION7,EVALUACION8,\
PRACTICA1,PRACTICA2,PRACTICA3,PRACTICA4,PARCIAL1,PARCIAL2";

#[test]
fn template_import_results_roundtrip() {
    let workspace = temp_dir("notas-exchange-roundtrip");
    let template_path = workspace.join("plantilla.csv");
    let filled_path = workspace.join("notas-llenas.csv");
    let results_path = workspace.join("resultados.csv");

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (course_id, _ana_id, _bruno_id) = seed_pair(&mut stdin, &mut reader);

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "exchange.exportTemplate",
        json!({
            "courseId": course_id,
            "outPath": template_path.to_string_lossy()
        }),
    );
    assert_eq!(exported.get("rowsExported").and_then(|v| v.as_u64()), Some(2));

    let template = std::fs::read_to_string(&template_path).expect("read template");
    let lines: Vec<&str> = template.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], TEMPLATE_HEADER);
    // Roster order, grade cells blank.
    assert_eq!(lines[1], format!("40000002,Bruno,Mamani{}", ",".repeat(14)));
    assert_eq!(lines[2], format!("40000001,Ana,Quispe{}", ",".repeat(14)));

    // Import needs an open gradebook: cells land in the session, not the store.
    let no_session = request(
        &mut stdin,
        &mut reader,
        "3",
        "exchange.importGrades",
        json!({
            "courseId": course_id,
            "inPath": filled_path.to_string_lossy()
        }),
    );
    assert_eq!(error_code(&no_session), Some("no_session"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "gradebook.open",
        json!({ "courseId": course_id }),
    );

    // A filled sheet: fewer columns than the template and reordered, matched
    // by header name; one bad mark, one unknown DNI, one row without DNI.
    let filled = "\
DNI,NOMBRE,APELLIDO,PARCIAL1,PRACTICA1
40000001,Ana,Quispe,14,
40000002,Bruno,Mamani,.,16
99999999,Nadie,Perdido,12,
,X,Y,10,
";
    std::fs::write(&filled_path, filled).expect("write filled sheet");

    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "exchange.importGrades",
        json!({
            "courseId": course_id,
            "inPath": filled_path.to_string_lossy()
        }),
    );
    assert_eq!(imported.get("appliedCells").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(imported.get("unsavedCount").and_then(|v| v.as_u64()), Some(2));
    let errors = imported
        .get("errors")
        .and_then(|v| v.as_array())
        .expect("errors");
    let codes: Vec<&str> = errors
        .iter()
        .filter_map(|e| e.get("code").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(codes, vec!["invalid_score", "not_found", "bad_params"]);
    assert_eq!(errors[0].get("line").and_then(|v| v.as_u64()), Some(3));
    assert_eq!(
        errors[0].get("field").and_then(|v| v.as_str()),
        Some("parcial1")
    );

    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "gradebook.saveAll",
        json!({ "courseId": course_id }),
    );
    assert_eq!(saved.get("savedCount").and_then(|v| v.as_u64()), Some(2));

    let results = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "exchange.exportResults",
        json!({
            "courseId": course_id,
            "outPath": results_path.to_string_lossy()
        }),
    );
    assert_eq!(results.get("rowsExported").and_then(|v| v.as_u64()), Some(2));

    let sheet = std::fs::read_to_string(&results_path).expect("read results");
    let lines: Vec<&str> = sheet.lines().collect();
    assert_eq!(lines[0], "N°,Apellidos y Nombres,Promedio General");
    assert_eq!(lines[1], "1,\"Mamani, Bruno\",16.00");
    assert_eq!(lines[2], "2,\"Quispe, Ana\",14.00");

    drop(stdin);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn exchange_rejects_malformed_sheets() {
    let workspace = temp_dir("notas-exchange-malformed");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (course_id, _ana, _bruno) = seed_pair(&mut stdin, &mut reader);

    let missing_course = request(
        &mut stdin,
        &mut reader,
        "2",
        "exchange.exportTemplate",
        json!({
            "courseId": "missing",
            "outPath": workspace.join("x.csv").to_string_lossy()
        }),
    );
    assert_eq!(error_code(&missing_course), Some("not_found"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "gradebook.open",
        json!({ "courseId": course_id }),
    );

    // No DNI column: nothing to match rows by.
    let no_dni = workspace.join("sin-dni.csv");
    std::fs::write(&no_dni, "NOMBRE,APELLIDO,PARCIAL1\nAna,Quispe,14\n").expect("write csv");
    let rejected = request(
        &mut stdin,
        &mut reader,
        "4",
        "exchange.importGrades",
        json!({ "courseId": course_id, "inPath": no_dni.to_string_lossy() }),
    );
    assert_eq!(error_code(&rejected), Some("parse_failed"));

    // A header without a single grade column is also useless.
    let no_grades = workspace.join("sin-notas.csv");
    std::fs::write(&no_grades, "DNI,NOMBRE,APELLIDO\n40000001,Ana,Quispe\n").expect("write csv");
    let rejected = request(
        &mut stdin,
        &mut reader,
        "5",
        "exchange.importGrades",
        json!({ "courseId": course_id, "inPath": no_grades.to_string_lossy() }),
    );
    assert_eq!(error_code(&rejected), Some("parse_failed"));

    let gone = request(
        &mut stdin,
        &mut reader,
        "6",
        "exchange.importGrades",
        json!({
            "courseId": course_id,
            "inPath": workspace.join("no-such-file.csv").to_string_lossy()
        }),
    );
    assert_eq!(error_code(&gone), Some("parse_failed"));

    drop(stdin);
    let _ = std::fs::remove_dir_all(workspace);
}
