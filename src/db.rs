use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params_from_iter, types::Value, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::model::{ClassRef, LabelRef, Occurrence, OccurrenceTypeRef, StudentRef, TeacherRef};
use crate::store::{OccurrenceQuery, OccurrenceStore, StoreError, StoreResult};

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Query(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Worker(e.to_string())
    }
}

pub const DB_FILE_NAME: &str = "occurrences.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS shifts(
            id TEXT PRIMARY KEY,
            label TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS education_levels(
            id TEXT PRIMARY KEY,
            label TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            institution_id TEXT NOT NULL,
            school_year INTEGER NOT NULL,
            name TEXT NOT NULL,
            shift_id TEXT,
            education_level_id TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_institution_year ON classes(institution_id, school_year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            institution_id TEXT NOT NULL,
            name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS occurrence_types(
            id TEXT PRIMARY KEY,
            institution_id TEXT NOT NULL,
            name TEXT NOT NULL,
            severity TEXT
        )",
        [],
    )?;

    // Occurrences reference the tables above only loosely; dangling ids are
    // tolerated and rendered with placeholder labels.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS occurrences(
            id TEXT PRIMARY KEY,
            institution_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            occurrence_type_id TEXT NOT NULL,
            occurred_at INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_occurrences_institution_time ON occurrences(institution_id, occurred_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_occurrences_class ON occurrences(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_occurrences_student ON occurrences(student_id)",
        [],
    )?;

    Ok(())
}

fn fresh_id(id: &str) -> String {
    let t = id.trim();
    if t.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        t.to_string()
    }
}

pub fn upsert_shift(conn: &Connection, shift: &LabelRef) -> anyhow::Result<String> {
    let id = fresh_id(&shift.id);
    conn.execute(
        "INSERT INTO shifts(id, label) VALUES(?, ?)
         ON CONFLICT(id) DO UPDATE SET label = excluded.label",
        (&id, &shift.label),
    )?;
    Ok(id)
}

pub fn upsert_education_level(conn: &Connection, level: &LabelRef) -> anyhow::Result<String> {
    let id = fresh_id(&level.id);
    conn.execute(
        "INSERT INTO education_levels(id, label) VALUES(?, ?)
         ON CONFLICT(id) DO UPDATE SET label = excluded.label",
        (&id, &level.label),
    )?;
    Ok(id)
}

pub fn insert_class(conn: &Connection, institution_id: &str, class: &ClassRef) -> anyhow::Result<String> {
    let id = fresh_id(&class.id);
    conn.execute(
        "INSERT INTO classes(id, institution_id, school_year, name, shift_id, education_level_id)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &id,
            institution_id,
            class.school_year,
            &class.name,
            &class.shift_id,
            &class.education_level_id,
        ),
    )?;
    Ok(id)
}

pub fn insert_student(conn: &Connection, student: &StudentRef) -> anyhow::Result<String> {
    let id = fresh_id(&student.id);
    conn.execute(
        "INSERT INTO students(id, class_id, name) VALUES(?, ?, ?)",
        (&id, &student.class_id, &student.name),
    )?;
    Ok(id)
}

pub fn insert_teacher(conn: &Connection, institution_id: &str, teacher: &TeacherRef) -> anyhow::Result<String> {
    let id = fresh_id(&teacher.id);
    conn.execute(
        "INSERT INTO teachers(id, institution_id, name) VALUES(?, ?, ?)",
        (&id, institution_id, &teacher.name),
    )?;
    Ok(id)
}

pub fn insert_occurrence_type(
    conn: &Connection,
    institution_id: &str,
    kind: &OccurrenceTypeRef,
) -> anyhow::Result<String> {
    let id = fresh_id(&kind.id);
    conn.execute(
        "INSERT INTO occurrence_types(id, institution_id, name, severity) VALUES(?, ?, ?, ?)",
        (&id, institution_id, &kind.name, &kind.severity),
    )?;
    Ok(id)
}

pub fn insert_occurrence(conn: &Connection, occ: &Occurrence) -> anyhow::Result<String> {
    let id = fresh_id(&occ.id);
    conn.execute(
        "INSERT INTO occurrences(id, institution_id, class_id, student_id, teacher_id, occurrence_type_id, occurred_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &occ.institution_id,
            &occ.class_id,
            &occ.student_id,
            &occ.teacher_id,
            &occ.occurrence_type_id,
            occ.occurred_at.timestamp_millis(),
        ),
    )?;
    Ok(id)
}

fn placeholders(n: usize) -> String {
    std::iter::repeat("?").take(n).collect::<Vec<_>>().join(",")
}

fn occurrence_where(q: &OccurrenceQuery) -> (String, Vec<Value>) {
    let mut clauses = vec!["institution_id = ?".to_string()];
    let mut values: Vec<Value> = vec![Value::Text(q.institution_id.clone())];
    if let Some(ids) = q.class_ids.as_ref() {
        clauses.push(format!("class_id IN ({})", placeholders(ids.len())));
        values.extend(ids.iter().map(|id| Value::Text(id.clone())));
    }
    for (column, v) in [
        ("student_id", &q.student_id),
        ("teacher_id", &q.teacher_id),
        ("occurrence_type_id", &q.occurrence_type_id),
    ] {
        if let Some(v) = v {
            clauses.push(format!("{column} = ?"));
            values.push(Value::Text(v.clone()));
        }
    }
    if let Some(range) = q.range {
        clauses.push("occurred_at BETWEEN ? AND ?".to_string());
        values.push(Value::Integer(range.start.timestamp_millis()));
        values.push(Value::Integer(range.end.timestamp_millis()));
    }
    (clauses.join(" AND "), values)
}

fn instant_from_millis(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(6, ms))
}

/// [`OccurrenceStore`] over a single SQLite connection. Queries run on the
/// blocking pool so callers never stall the runtime.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(workspace: &Path) -> anyhow::Result<Self> {
        Ok(Self::from_connection(open_db(workspace)?))
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Synchronous access for hosts that populate the store.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> anyhow::Result<T>) -> anyhow::Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("sqlite connection lock poisoned"))?;
        f(&guard)
    }

    async fn run<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Worker("sqlite connection lock poisoned".to_string()))?;
            f(&guard).map_err(StoreError::from)
        })
        .await?
    }

    async fn labels(&self, table: &'static str) -> StoreResult<Vec<LabelRef>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!("SELECT id, label FROM {table} ORDER BY label"))?;
            let rows = stmt.query_map([], |r| {
                Ok(LabelRef {
                    id: r.get(0)?,
                    label: r.get(1)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()
        })
        .await
    }
}

#[async_trait]
impl OccurrenceStore for SqliteStore {
    async fn count(&self, query: &OccurrenceQuery) -> StoreResult<u64> {
        if query.is_vacuous() {
            return Ok(0);
        }
        let (clause, values) = occurrence_where(query);
        self.run(move |conn| {
            let sql = format!("SELECT COUNT(*) FROM occurrences WHERE {clause}");
            let n: i64 = conn.query_row(&sql, params_from_iter(values), |r| r.get(0))?;
            Ok(n.max(0) as u64)
        })
        .await
    }

    async fn occurrences(&self, query: &OccurrenceQuery) -> StoreResult<Vec<Occurrence>> {
        if query.is_vacuous() {
            return Ok(Vec::new());
        }
        let (clause, values) = occurrence_where(query);
        self.run(move |conn| {
            let sql = format!(
                "SELECT id, institution_id, class_id, student_id, teacher_id, occurrence_type_id, occurred_at
                 FROM occurrences
                 WHERE {clause}
                 ORDER BY occurred_at, id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values), |r| {
                Ok(Occurrence {
                    id: r.get(0)?,
                    institution_id: r.get(1)?,
                    class_id: r.get(2)?,
                    student_id: r.get(3)?,
                    teacher_id: r.get(4)?,
                    occurrence_type_id: r.get(5)?,
                    occurred_at: instant_from_millis(r.get(6)?)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()
        })
        .await
    }

    async fn classes(&self, institution_id: &str, school_year: i32) -> StoreResult<Vec<ClassRef>> {
        let institution_id = institution_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, school_year, shift_id, education_level_id
                 FROM classes
                 WHERE institution_id = ? AND school_year = ?
                 ORDER BY name",
            )?;
            let rows = stmt.query_map((&institution_id, school_year), |r| {
                Ok(ClassRef {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    school_year: r.get(2)?,
                    shift_id: r.get(3)?,
                    education_level_id: r.get(4)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()
        })
        .await
    }

    async fn students(&self, class_ids: &[String]) -> StoreResult<Vec<StudentRef>> {
        if class_ids.is_empty() {
            return Ok(Vec::new());
        }
        let values: Vec<Value> = class_ids.iter().map(|id| Value::Text(id.clone())).collect();
        self.run(move |conn| {
            let sql = format!(
                "SELECT id, class_id, name FROM students WHERE class_id IN ({}) ORDER BY name",
                placeholders(values.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values), |r| {
                Ok(StudentRef {
                    id: r.get(0)?,
                    class_id: r.get(1)?,
                    name: r.get(2)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()
        })
        .await
    }

    async fn teachers(&self, institution_id: &str) -> StoreResult<Vec<TeacherRef>> {
        let institution_id = institution_id.to_string();
        self.run(move |conn| {
            let mut stmt =
                conn.prepare("SELECT id, name FROM teachers WHERE institution_id = ? ORDER BY name")?;
            let rows = stmt.query_map([&institution_id], |r| {
                Ok(TeacherRef {
                    id: r.get(0)?,
                    name: r.get(1)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()
        })
        .await
    }

    async fn occurrence_types(&self, institution_id: &str) -> StoreResult<Vec<OccurrenceTypeRef>> {
        let institution_id = institution_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, severity FROM occurrence_types WHERE institution_id = ? ORDER BY name",
            )?;
            let rows = stmt.query_map([&institution_id], |r| {
                Ok(OccurrenceTypeRef {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    severity: r.get(2)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()
        })
        .await
    }

    async fn shifts(&self) -> StoreResult<Vec<LabelRef>> {
        self.labels("shifts").await
    }

    async fn education_levels(&self) -> StoreResult<Vec<LabelRef>> {
        self.labels("education_levels").await
    }
}
