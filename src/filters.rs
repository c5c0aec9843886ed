//! Cross-filter state: at most one filter per dimension.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DashboardError;
use crate::model::YearMonth;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Dimension {
    Month,
    Class,
    Student,
    OccurrenceType,
    Teacher,
    Shift,
    EducationLevel,
    SpecificDate,
    Weekday,
}

impl Dimension {
    pub const ALL: [Dimension; 9] = [
        Dimension::Month,
        Dimension::Class,
        Dimension::Student,
        Dimension::OccurrenceType,
        Dimension::Teacher,
        Dimension::Shift,
        Dimension::EducationLevel,
        Dimension::SpecificDate,
        Dimension::Weekday,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Dimension::Month => "month",
            Dimension::Class => "class",
            Dimension::Student => "student",
            Dimension::OccurrenceType => "occurrenceType",
            Dimension::Teacher => "teacher",
            Dimension::Shift => "shift",
            Dimension::EducationLevel => "educationLevel",
            Dimension::SpecificDate => "specificDate",
            Dimension::Weekday => "weekday",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dimension {
    type Err = DashboardError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "month" => Ok(Dimension::Month),
            "class" => Ok(Dimension::Class),
            "student" => Ok(Dimension::Student),
            "occurrenceType" | "type" => Ok(Dimension::OccurrenceType),
            "teacher" => Ok(Dimension::Teacher),
            "shift" => Ok(Dimension::Shift),
            "educationLevel" => Ok(Dimension::EducationLevel),
            "specificDate" => Ok(Dimension::SpecificDate),
            "weekday" => Ok(Dimension::Weekday),
            other => Err(DashboardError::UnknownDimension(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValue {
    Month(YearMonth),
    Class(String),
    Student(String),
    OccurrenceType(String),
    Teacher(String),
    Shift(String),
    EducationLevel(String),
    SpecificDate(NaiveDate),
    /// Monday = 1 .. Friday = 5.
    Weekday(u8),
}

impl FilterValue {
    pub fn dimension(&self) -> Dimension {
        match self {
            FilterValue::Month(_) => Dimension::Month,
            FilterValue::Class(_) => Dimension::Class,
            FilterValue::Student(_) => Dimension::Student,
            FilterValue::OccurrenceType(_) => Dimension::OccurrenceType,
            FilterValue::Teacher(_) => Dimension::Teacher,
            FilterValue::Shift(_) => Dimension::Shift,
            FilterValue::EducationLevel(_) => Dimension::EducationLevel,
            FilterValue::SpecificDate(_) => Dimension::SpecificDate,
            FilterValue::Weekday(_) => Dimension::Weekday,
        }
    }

    pub fn parse(dimension: Dimension, raw: &str) -> Result<Self, DashboardError> {
        let bad = || DashboardError::InvalidFilterValue {
            dimension: dimension.to_string(),
            value: raw.to_string(),
        };
        let t = raw.trim();
        if t.is_empty() {
            return Err(bad());
        }
        let v = match dimension {
            Dimension::Month => FilterValue::Month(YearMonth::parse(t).ok_or_else(bad)?),
            Dimension::Class => FilterValue::Class(t.to_string()),
            Dimension::Student => FilterValue::Student(t.to_string()),
            Dimension::OccurrenceType => FilterValue::OccurrenceType(t.to_string()),
            Dimension::Teacher => FilterValue::Teacher(t.to_string()),
            Dimension::Shift => FilterValue::Shift(t.to_string()),
            Dimension::EducationLevel => FilterValue::EducationLevel(t.to_string()),
            Dimension::SpecificDate => FilterValue::SpecificDate(
                NaiveDate::parse_from_str(t, "%Y-%m-%d").map_err(|_| bad())?,
            ),
            Dimension::Weekday => {
                let n = t.parse::<u8>().map_err(|_| bad())?;
                if !(1..=5).contains(&n) {
                    return Err(bad());
                }
                FilterValue::Weekday(n)
            }
        };
        Ok(v)
    }

    /// Wire form of the value, inverse of [`FilterValue::parse`].
    pub fn raw(&self) -> String {
        match self {
            FilterValue::Month(m) => m.to_string(),
            FilterValue::Class(id)
            | FilterValue::Student(id)
            | FilterValue::OccurrenceType(id)
            | FilterValue::Teacher(id)
            | FilterValue::Shift(id)
            | FilterValue::EducationLevel(id) => id.clone(),
            FilterValue::SpecificDate(d) => d.format("%Y-%m-%d").to_string(),
            FilterValue::Weekday(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub value: FilterValue,
    pub label: String,
}

impl Filter {
    pub fn new(value: FilterValue, label: impl Into<String>) -> Self {
        Self {
            value,
            label: label.into(),
        }
    }

    pub fn dimension(&self) -> Dimension {
        self.value.dimension()
    }
}

impl Serialize for Filter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("Filter", 3)?;
        s.serialize_field("dimension", &self.dimension())?;
        s.serialize_field("value", &self.value.raw())?;
        s.serialize_field("label", &self.label)?;
        s.end()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSet {
    month: Option<Filter>,
    class: Option<Filter>,
    student: Option<Filter>,
    occurrence_type: Option<Filter>,
    teacher: Option<Filter>,
    shift: Option<Filter>,
    education_level: Option<Filter>,
    specific_date: Option<Filter>,
    weekday: Option<Filter>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, dimension: Dimension) -> &Option<Filter> {
        match dimension {
            Dimension::Month => &self.month,
            Dimension::Class => &self.class,
            Dimension::Student => &self.student,
            Dimension::OccurrenceType => &self.occurrence_type,
            Dimension::Teacher => &self.teacher,
            Dimension::Shift => &self.shift,
            Dimension::EducationLevel => &self.education_level,
            Dimension::SpecificDate => &self.specific_date,
            Dimension::Weekday => &self.weekday,
        }
    }

    fn slot_mut(&mut self, dimension: Dimension) -> &mut Option<Filter> {
        match dimension {
            Dimension::Month => &mut self.month,
            Dimension::Class => &mut self.class,
            Dimension::Student => &mut self.student,
            Dimension::OccurrenceType => &mut self.occurrence_type,
            Dimension::Teacher => &mut self.teacher,
            Dimension::Shift => &mut self.shift,
            Dimension::EducationLevel => &mut self.education_level,
            Dimension::SpecificDate => &mut self.specific_date,
            Dimension::Weekday => &mut self.weekday,
        }
    }

    /// Upserts `filter` into its dimension's slot. SpecificDate and Weekday
    /// evict each other. Returns whether the set changed.
    pub fn add(&mut self, filter: Filter) -> bool {
        let before = self.clone();
        let dimension = filter.dimension();
        match dimension {
            Dimension::SpecificDate => self.weekday = None,
            Dimension::Weekday => self.specific_date = None,
            _ => {}
        }
        *self.slot_mut(dimension) = Some(filter);
        *self != before
    }

    pub fn remove(&mut self, dimension: Dimension) -> bool {
        self.slot_mut(dimension).take().is_some()
    }

    pub fn clear(&mut self) -> bool {
        let had_any = self.has_active();
        *self = Self::default();
        had_any
    }

    pub fn has_active(&self) -> bool {
        Dimension::ALL.iter().any(|d| self.slot(*d).is_some())
    }

    pub fn get(&self, dimension: Dimension) -> Option<&Filter> {
        self.slot(dimension).as_ref()
    }

    pub fn active(&self) -> Vec<&Filter> {
        Dimension::ALL
            .iter()
            .filter_map(|d| self.slot(*d).as_ref())
            .collect()
    }

    pub fn month(&self) -> Option<YearMonth> {
        match self.month.as_ref().map(|f| &f.value) {
            Some(FilterValue::Month(m)) => Some(*m),
            _ => None,
        }
    }

    pub fn class_id(&self) -> Option<&str> {
        match self.class.as_ref().map(|f| &f.value) {
            Some(FilterValue::Class(id)) => Some(id),
            _ => None,
        }
    }

    pub fn student_id(&self) -> Option<&str> {
        match self.student.as_ref().map(|f| &f.value) {
            Some(FilterValue::Student(id)) => Some(id),
            _ => None,
        }
    }

    pub fn occurrence_type_id(&self) -> Option<&str> {
        match self.occurrence_type.as_ref().map(|f| &f.value) {
            Some(FilterValue::OccurrenceType(id)) => Some(id),
            _ => None,
        }
    }

    pub fn teacher_id(&self) -> Option<&str> {
        match self.teacher.as_ref().map(|f| &f.value) {
            Some(FilterValue::Teacher(id)) => Some(id),
            _ => None,
        }
    }

    pub fn shift_id(&self) -> Option<&str> {
        match self.shift.as_ref().map(|f| &f.value) {
            Some(FilterValue::Shift(id)) => Some(id),
            _ => None,
        }
    }

    pub fn education_level_id(&self) -> Option<&str> {
        match self.education_level.as_ref().map(|f| &f.value) {
            Some(FilterValue::EducationLevel(id)) => Some(id),
            _ => None,
        }
    }

    pub fn specific_date(&self) -> Option<NaiveDate> {
        match self.specific_date.as_ref().map(|f| &f.value) {
            Some(FilterValue::SpecificDate(d)) => Some(*d),
            _ => None,
        }
    }

    pub fn weekday(&self) -> Option<u8> {
        match self.weekday.as_ref().map(|f| &f.value) {
            Some(FilterValue::Weekday(n)) => Some(*n),
            _ => None,
        }
    }
}
