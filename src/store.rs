//! Abstract occurrence store capability consumed by the analytics core.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{ClassRef, LabelRef, Occurrence, OccurrenceTypeRef, StudentRef, TeacherRef};
use crate::window::TimeWindow;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store query failed: {0}")]
    Query(String),
    #[error("store worker failed: {0}")]
    Worker(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Equality predicates plus an inclusive `occurred_at` range.
///
/// `class_ids: Some(vec![])` matches nothing; `None` leaves the class
/// unconstrained.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OccurrenceQuery {
    pub institution_id: String,
    pub class_ids: Option<Vec<String>>,
    pub student_id: Option<String>,
    pub teacher_id: Option<String>,
    pub occurrence_type_id: Option<String>,
    pub range: Option<TimeWindow>,
}

impl OccurrenceQuery {
    pub fn for_institution(institution_id: impl Into<String>) -> Self {
        Self {
            institution_id: institution_id.into(),
            ..Self::default()
        }
    }

    pub fn with_range(&self, range: TimeWindow) -> Self {
        Self {
            range: Some(range),
            ..self.clone()
        }
    }

    /// True when the predicates cannot match any record.
    pub fn is_vacuous(&self) -> bool {
        self.class_ids.as_ref().map(|c| c.is_empty()).unwrap_or(false)
            || self.range.map(|r| r.is_empty()).unwrap_or(false)
    }
}

#[async_trait]
pub trait OccurrenceStore: Send + Sync {
    async fn count(&self, query: &OccurrenceQuery) -> StoreResult<u64>;
    async fn occurrences(&self, query: &OccurrenceQuery) -> StoreResult<Vec<Occurrence>>;

    async fn classes(&self, institution_id: &str, school_year: i32) -> StoreResult<Vec<ClassRef>>;
    async fn students(&self, class_ids: &[String]) -> StoreResult<Vec<StudentRef>>;
    async fn teachers(&self, institution_id: &str) -> StoreResult<Vec<TeacherRef>>;
    async fn occurrence_types(&self, institution_id: &str) -> StoreResult<Vec<OccurrenceTypeRef>>;
    async fn shifts(&self) -> StoreResult<Vec<LabelRef>>;
    async fn education_levels(&self) -> StoreResult<Vec<LabelRef>>;
}
