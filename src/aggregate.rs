//! Chart-ready aggregates over a filtered occurrence set.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::calendar::{school_day_from_number, school_day_number, weekday_name, LocalCalendar};
use crate::error::DashboardError;
use crate::model::{ClassRef, LabelRef, Occurrence, OccurrenceTypeRef, StudentRef, TeacherRef};
use crate::window::MonthBucket;

pub const UNKNOWN_CLASS: &str = "Unknown class";
pub const UNKNOWN_STUDENT: &str = "Unknown student";
pub const UNKNOWN_TEACHER: &str = "Unknown teacher";
pub const UNKNOWN_TYPE: &str = "Unknown type";
pub const NO_SHIFT: &str = "No shift";
pub const NO_EDUCATION_LEVEL: &str = "No education level";
pub const UNKNOWN_SHIFT: &str = "Unknown shift";
pub const UNKNOWN_EDUCATION_LEVEL: &str = "Unknown education level";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Facet {
    Class,
    Student,
    #[serde(rename = "type")]
    OccurrenceType,
    Teacher,
    Monthly,
    Weekday,
    Shift,
    EducationLevel,
    Kpi,
}

impl Facet {
    pub const ALL: [Facet; 9] = [
        Facet::Class,
        Facet::Student,
        Facet::OccurrenceType,
        Facet::Teacher,
        Facet::Monthly,
        Facet::Weekday,
        Facet::Shift,
        Facet::EducationLevel,
        Facet::Kpi,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Facet::Class => "class",
            Facet::Student => "student",
            Facet::OccurrenceType => "type",
            Facet::Teacher => "teacher",
            Facet::Monthly => "monthly",
            Facet::Weekday => "weekday",
            Facet::Shift => "shift",
            Facet::EducationLevel => "educationLevel",
            Facet::Kpi => "kpi",
        }
    }
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Facet {
    type Err = DashboardError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Facet::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == raw.trim())
            .ok_or_else(|| DashboardError::UnknownFacet(raw.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WeekdayMode {
    Week,
    #[default]
    Average,
    MonthDetail,
}

impl FromStr for WeekdayMode {
    type Err = DashboardError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "week" => Ok(WeekdayMode::Week),
            "average" => Ok(WeekdayMode::Average),
            "monthDetail" => Ok(WeekdayMode::MonthDetail),
            other => Err(DashboardError::InvalidViewMode(other.to_string())),
        }
    }
}

/// Change against the immediately preceding row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Variance {
    Percent(f64),
    /// Previous row was zero and this one is not.
    New,
}

impl Serialize for Variance {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Variance::Percent(p) => serializer.serialize_f64(*p),
            Variance::New => serializer.serialize_str("new"),
        }
    }
}

pub fn variance(prev: f64, curr: f64) -> Variance {
    if prev > 0.0 {
        Variance::Percent((curr - prev) / prev * 100.0)
    } else if curr > 0.0 {
        Variance::New
    } else {
        Variance::Percent(0.0)
    }
}

/// Half-up 1-decimal rounding: `Int(10*x + 0.5) / 10`
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetRow {
    pub label: String,
    pub id: String,
    pub count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent_change: Option<Variance>,
}

impl FacetRow {
    fn counted(id: impl Into<String>, label: impl Into<String>, count: u64) -> Self {
        Self {
            label: label.into(),
            id: id.into(),
            count,
            average: None,
            percent_change: None,
        }
    }

    /// Value the chart plots: the average when present, else the count.
    pub fn value(&self) -> f64 {
        self.average.unwrap_or(self.count as f64)
    }
}

/// Fills `percent_change` for every row after the first.
fn chain_variance(rows: &mut [FacetRow]) {
    for i in 1..rows.len() {
        let prev = rows[i - 1].value();
        let curr = rows[i].value();
        rows[i].percent_change = Some(variance(prev, curr));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOrder {
    LabelAscending,
    CountDescending,
}

fn sort_rows(rows: &mut [FacetRow], order: RowOrder) {
    match order {
        RowOrder::LabelAscending => rows.sort_by(|a, b| {
            a.label
                .to_lowercase()
                .cmp(&b.label.to_lowercase())
                .then_with(|| a.id.cmp(&b.id))
        }),
        RowOrder::CountDescending => rows.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.label.to_lowercase().cmp(&b.label.to_lowercase()))
                .then_with(|| a.id.cmp(&b.id))
        }),
    }
}

/// Groups by `key`, counts, and labels each group. A `None` key or an
/// unresolvable label falls back to `placeholder`.
fn grouped<K, L>(records: &[Occurrence], key: K, label: L, placeholder: &str, order: RowOrder) -> Vec<FacetRow>
where
    K: Fn(&Occurrence) -> Option<String>,
    L: Fn(&str) -> Option<String>,
{
    let mut counts: BTreeMap<Option<String>, u64> = BTreeMap::new();
    for r in records {
        *counts.entry(key(r)).or_insert(0) += 1;
    }
    let mut rows: Vec<FacetRow> = counts
        .into_iter()
        .map(|(id, count)| {
            let text = id
                .as_deref()
                .and_then(|id| label(id))
                .unwrap_or_else(|| placeholder.to_string());
            FacetRow::counted(id.unwrap_or_default(), text, count)
        })
        .collect();
    sort_rows(&mut rows, order);
    rows
}

pub fn by_class(records: &[Occurrence], classes: &[ClassRef]) -> Vec<FacetRow> {
    let names: HashMap<&str, &str> = classes.iter().map(|c| (c.id.as_str(), c.name.as_str())).collect();
    grouped(
        records,
        |r| Some(r.class_id.clone()),
        |id| names.get(id).map(|n| n.to_string()),
        UNKNOWN_CLASS,
        RowOrder::LabelAscending,
    )
}

pub fn by_student(records: &[Occurrence], students: &[StudentRef]) -> Vec<FacetRow> {
    let names: HashMap<&str, &str> = students.iter().map(|s| (s.id.as_str(), s.name.as_str())).collect();
    grouped(
        records,
        |r| Some(r.student_id.clone()),
        |id| names.get(id).map(|n| n.to_string()),
        UNKNOWN_STUDENT,
        RowOrder::CountDescending,
    )
}

pub fn by_teacher(records: &[Occurrence], teachers: &[TeacherRef]) -> Vec<FacetRow> {
    let names: HashMap<&str, &str> = teachers.iter().map(|t| (t.id.as_str(), t.name.as_str())).collect();
    grouped(
        records,
        |r| Some(r.teacher_id.clone()),
        |id| names.get(id).map(|n| n.to_string()),
        UNKNOWN_TEACHER,
        RowOrder::CountDescending,
    )
}

pub fn by_occurrence_type(records: &[Occurrence], types: &[OccurrenceTypeRef]) -> Vec<FacetRow> {
    let kinds: HashMap<&str, &OccurrenceTypeRef> = types.iter().map(|t| (t.id.as_str(), t)).collect();
    grouped(
        records,
        |r| Some(r.occurrence_type_id.clone()),
        |id| kinds.get(id).map(|t| t.display_label()),
        UNKNOWN_TYPE,
        RowOrder::CountDescending,
    )
}

pub fn by_shift(records: &[Occurrence], classes: &[ClassRef], shifts: &[LabelRef]) -> Vec<FacetRow> {
    by_class_attribute(records, classes, shifts, |c| c.shift_id.clone(), NO_SHIFT, UNKNOWN_SHIFT)
}

pub fn by_education_level(records: &[Occurrence], classes: &[ClassRef], levels: &[LabelRef]) -> Vec<FacetRow> {
    by_class_attribute(
        records,
        classes,
        levels,
        |c| c.education_level_id.clone(),
        NO_EDUCATION_LEVEL,
        UNKNOWN_EDUCATION_LEVEL,
    )
}

fn by_class_attribute<A>(
    records: &[Occurrence],
    classes: &[ClassRef],
    labels: &[LabelRef],
    attribute: A,
    missing: &str,
    dangling: &str,
) -> Vec<FacetRow>
where
    A: Fn(&ClassRef) -> Option<String>,
{
    let class_attr: HashMap<&str, Option<String>> =
        classes.iter().map(|c| (c.id.as_str(), attribute(c))).collect();
    let names: HashMap<&str, &str> = labels.iter().map(|l| (l.id.as_str(), l.label.as_str())).collect();
    grouped(
        records,
        |r| class_attr.get(r.class_id.as_str()).cloned().flatten(),
        // An id with no label row is not the same as no id at all.
        |id| Some(names.get(id).map_or_else(|| dangling.to_string(), |n| n.to_string())),
        missing,
        RowOrder::CountDescending,
    )
}

/// Month-over-month waterfall; `counts[i]` belongs to `buckets[i]`.
pub fn monthly_waterfall(buckets: &[MonthBucket], counts: &[u64]) -> Vec<FacetRow> {
    let mut rows: Vec<FacetRow> = buckets
        .iter()
        .zip(counts.iter().copied().chain(std::iter::repeat(0)))
        .map(|(b, count)| FacetRow::counted(b.month.to_string(), b.label.clone(), count))
        .collect();
    chain_variance(&mut rows);
    rows
}

/// Monday..Friday of the week starting at `monday`; days without records
/// count zero.
pub fn weekday_week(cal: &LocalCalendar, records: &[Occurrence], monday: NaiveDate) -> Vec<FacetRow> {
    let mut per_day: HashMap<NaiveDate, u64> = HashMap::new();
    for r in records {
        *per_day.entry(cal.local_date(r.occurred_at)).or_insert(0) += 1;
    }
    let mut rows: Vec<FacetRow> = (0..5)
        .map(|offset| {
            let day = monday + chrono::Duration::days(offset);
            FacetRow::counted(
                day.format("%Y-%m-%d").to_string(),
                cal.day_label(day),
                per_day.get(&day).copied().unwrap_or(0),
            )
        })
        .collect();
    chain_variance(&mut rows);
    rows
}

/// Per school weekday: total occurrences divided by the number of distinct
/// ISO weeks in which that weekday had any.
pub fn weekday_average(cal: &LocalCalendar, records: &[Occurrence]) -> Vec<FacetRow> {
    let mut totals = [0_u64; 5];
    let mut weeks: [HashSet<(i32, u32)>; 5] = Default::default();
    for r in records {
        let date = cal.local_date(r.occurred_at);
        let Some(n) = school_day_number(date.weekday()) else {
            continue;
        };
        let idx = (n - 1) as usize;
        totals[idx] += 1;
        let iso = date.iso_week();
        weeks[idx].insert((iso.year(), iso.week()));
    }
    let mut rows: Vec<FacetRow> = (1..=5_u8)
        .map(|n| {
            let idx = (n - 1) as usize;
            let distinct = weeks[idx].len();
            let avg = if distinct > 0 {
                round_off_1_decimal(totals[idx] as f64 / distinct as f64)
            } else {
                0.0
            };
            let name = school_day_from_number(n).map(weekday_name).unwrap_or_default();
            let mut row = FacetRow::counted(n.to_string(), name, totals[idx]);
            row.average = Some(avg);
            row
        })
        .collect();
    chain_variance(&mut rows);
    rows
}

/// Every local date with at least one record, ascending.
pub fn weekday_month_detail(cal: &LocalCalendar, records: &[Occurrence]) -> Vec<FacetRow> {
    let mut per_day: BTreeMap<NaiveDate, u64> = BTreeMap::new();
    for r in records {
        *per_day.entry(cal.local_date(r.occurred_at)).or_insert(0) += 1;
    }
    let mut rows: Vec<FacetRow> = per_day
        .into_iter()
        .map(|(day, count)| FacetRow::counted(day.format("%Y-%m-%d").to_string(), cal.day_label(day), count))
        .collect();
    chain_variance(&mut rows);
    rows
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiSummary {
    pub total_occurrences: u64,
    pub students_with_occurrences: u64,
    pub students_without_occurrences: u64,
    pub total_students_in_scope: u64,
}

pub fn kpi_summary(records: &[Occurrence], students_in_scope: &[StudentRef]) -> KpiSummary {
    let with: BTreeSet<&str> = records.iter().map(|r| r.student_id.as_str()).collect();
    let in_scope: BTreeSet<&str> = students_in_scope.iter().map(|s| s.id.as_str()).collect();
    let total_students = in_scope.len() as u64;
    let students_with = with.len() as u64;
    KpiSummary {
        total_occurrences: records.len() as u64,
        students_with_occurrences: students_with,
        students_without_occurrences: total_students.saturating_sub(students_with),
        total_students_in_scope: total_students,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FacetValue {
    Rows(Vec<FacetRow>),
    Weekday { mode: WeekdayMode, rows: Vec<FacetRow> },
    Kpi(KpiSummary),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetResults {
    pub class: Vec<FacetRow>,
    pub student: Vec<FacetRow>,
    #[serde(rename = "type")]
    pub occurrence_type: Vec<FacetRow>,
    pub teacher: Vec<FacetRow>,
    pub monthly: Vec<FacetRow>,
    pub weekday: Vec<FacetRow>,
    /// View mode the weekday rows were computed with.
    pub weekday_mode: WeekdayMode,
    pub shift: Vec<FacetRow>,
    pub education_level: Vec<FacetRow>,
    pub kpi: KpiSummary,
}

impl FacetResults {
    pub fn apply(&mut self, facet: Facet, value: FacetValue) {
        match (facet, value) {
            (Facet::Kpi, FacetValue::Kpi(k)) => self.kpi = k,
            (Facet::Weekday, FacetValue::Weekday { mode, rows }) => {
                self.weekday_mode = mode;
                self.weekday = rows;
            }
            (facet, FacetValue::Rows(rows)) => {
                if let Some(slot) = self.rows_mut(facet) {
                    *slot = rows;
                }
            }
            (facet, other) => {
                tracing::warn!(%facet, ?other, "facet value does not match facet; ignored");
            }
        }
    }

    fn rows_mut(&mut self, facet: Facet) -> Option<&mut Vec<FacetRow>> {
        match facet {
            Facet::Class => Some(&mut self.class),
            Facet::Student => Some(&mut self.student),
            Facet::OccurrenceType => Some(&mut self.occurrence_type),
            Facet::Teacher => Some(&mut self.teacher),
            Facet::Monthly => Some(&mut self.monthly),
            Facet::Weekday => Some(&mut self.weekday),
            Facet::Shift => Some(&mut self.shift),
            Facet::EducationLevel => Some(&mut self.education_level),
            Facet::Kpi => None,
        }
    }

    pub fn rows(&self, facet: Facet) -> Option<&[FacetRow]> {
        match facet {
            Facet::Class => Some(&self.class),
            Facet::Student => Some(&self.student),
            Facet::OccurrenceType => Some(&self.occurrence_type),
            Facet::Teacher => Some(&self.teacher),
            Facet::Monthly => Some(&self.monthly),
            Facet::Weekday => Some(&self.weekday),
            Facet::Shift => Some(&self.shift),
            Facet::EducationLevel => Some(&self.education_level),
            Facet::Kpi => None,
        }
    }
}
