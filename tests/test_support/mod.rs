#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::America::Sao_Paulo;
use occurrenced::db::{self, SqliteStore};
use occurrenced::model::{ClassRef, LabelRef, Occurrence, OccurrenceTypeRef, StudentRef, TeacherRef};
use rusqlite::Connection;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub const INSTITUTION: &str = "inst-1";
pub const TIMEZONE: &str = "America/Sao_Paulo";

pub fn temp_dir(prefix: &str) -> PathBuf {
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

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_occurrenced");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .env("OCCURRENCED_QUIESCENCE_MS", "20")
        .spawn()
        .expect("spawn occurrenced");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or(serde_json::Value::Null)
}

pub fn error_code(value: &serde_json::Value) -> Option<&str> {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

/// Wall-clock time in São Paulo, as stored.
pub fn local(y: i32, m: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Sao_Paulo
        .with_ymd_and_hms(y, m, d, h, mi, 0)
        .single()
        .expect("unambiguous local time")
        .with_timezone(&Utc)
}

fn occurrence(
    id: &str,
    institution_id: &str,
    class_id: &str,
    student_id: &str,
    teacher_id: &str,
    type_id: &str,
    at: DateTime<Utc>,
) -> Occurrence {
    Occurrence {
        id: id.into(),
        institution_id: institution_id.into(),
        class_id: class_id.into(),
        student_id: student_id.into(),
        teacher_id: teacher_id.into(),
        occurrence_type_id: type_id.into(),
        occurred_at: at,
    }
}

/// School year 2025 fixture:
///
/// | class   | shift   | level         | students            |
/// |---------|---------|---------------|---------------------|
/// | Class A | Morning | Elementary    | Ana (3), Bia (1)    |
/// | Class B | Evening | Middle School | Caio (2), Duda (0)  |
///
/// plus a 2024 class and an occurrence of another institution, both out of
/// scope for 2025.
pub fn seed_school(conn: &Connection) -> anyhow::Result<()> {
    for (id, label) in [("morning", "Morning"), ("evening", "Evening")] {
        db::upsert_shift(conn, &LabelRef { id: id.into(), label: label.into() })?;
    }
    for (id, label) in [("elem", "Elementary"), ("mid", "Middle School")] {
        db::upsert_education_level(conn, &LabelRef { id: id.into(), label: label.into() })?;
    }
    for (id, name, year, shift, level) in [
        ("c-a", "Class A", 2025, "morning", "elem"),
        ("c-b", "Class B", 2025, "evening", "mid"),
        ("c-old", "Class Old", 2024, "morning", "elem"),
    ] {
        db::insert_class(
            conn,
            INSTITUTION,
            &ClassRef {
                id: id.into(),
                name: name.into(),
                school_year: year,
                shift_id: Some(shift.into()),
                education_level_id: Some(level.into()),
            },
        )?;
    }
    for (id, class_id, name) in [
        ("s-ana", "c-a", "Ana"),
        ("s-bia", "c-a", "Bia"),
        ("s-caio", "c-b", "Caio"),
        ("s-duda", "c-b", "Duda"),
        ("s-olga", "c-old", "Olga"),
    ] {
        db::insert_student(
            conn,
            &StudentRef {
                id: id.into(),
                class_id: class_id.into(),
                name: name.into(),
            },
        )?;
    }
    for (id, name) in [("t-1", "Teacher One"), ("t-2", "Teacher Two")] {
        db::insert_teacher(conn, INSTITUTION, &TeacherRef { id: id.into(), name: name.into() })?;
    }
    for (id, name, severity) in [("ty-late", "Late", "low"), ("ty-fight", "Fight", "high")] {
        db::insert_occurrence_type(
            conn,
            INSTITUTION,
            &OccurrenceTypeRef {
                id: id.into(),
                name: name.into(),
                severity: Some(severity.into()),
            },
        )?;
    }

    let rows = [
        occurrence("o1", INSTITUTION, "c-a", "s-ana", "t-1", "ty-late", local(2025, 3, 3, 10, 0)),
        occurrence("o2", INSTITUTION, "c-a", "s-ana", "t-1", "ty-late", local(2025, 3, 10, 10, 0)),
        occurrence("o3", INSTITUTION, "c-a", "s-ana", "t-2", "ty-fight", local(2025, 4, 8, 9, 0)),
        // Late evening: already the next day in UTC.
        occurrence("o4", INSTITUTION, "c-a", "s-bia", "t-2", "ty-late", local(2025, 3, 4, 23, 50)),
        occurrence("o5", INSTITUTION, "c-b", "s-caio", "t-1", "ty-fight", local(2025, 3, 5, 8, 0)),
        occurrence("o6", INSTITUTION, "c-b", "s-caio", "t-2", "ty-late", local(2025, 5, 6, 14, 0)),
        occurrence("o7", INSTITUTION, "c-old", "s-olga", "t-1", "ty-late", local(2024, 6, 3, 10, 0)),
        occurrence("o8", "inst-2", "c-x", "s-x", "t-x", "ty-x", local(2025, 3, 3, 11, 0)),
    ];
    for row in &rows {
        db::insert_occurrence(conn, row)?;
    }
    Ok(())
}

pub fn seeded_store() -> SqliteStore {
    let store = SqliteStore::open_in_memory().expect("open in-memory store");
    store.with_conn(seed_school).expect("seed school");
    store
}

pub fn seed_workspace(workspace: &std::path::Path) {
    let conn = db::open_db(workspace).expect("open workspace db");
    seed_school(&conn).expect("seed school");
}
