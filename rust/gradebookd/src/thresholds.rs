//! Grade-threshold tables and the pure edits the threshold editor applies.
//!
//! A table is an ordered list of bands `{min, max, label}` over a total-mark
//! scale. Order is user-controlled and is the evaluation order; nothing here
//! sorts it. Every edit returns a new list and leaves its input untouched.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use thiserror::Error;

pub const DEFAULT_TOTAL_MARKS: f64 = 100.0;
pub const MIN_TOTAL_MARKS: f64 = 1.0;
pub const MAX_TOTAL_MARKS: f64 = 1000.0;

const MIN_GRADE_LEVEL: u8 = 7;
const MAX_GRADE_LEVEL: u8 = 13;
const FIRST_TRACKED_LEVEL: u8 = 12;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ThresholdError {
    #[error("a grading context must keep at least one threshold")]
    CannotRemoveLastThreshold,

    #[error("threshold index {index} is out of range (have {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("{field} must be a number, got {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("total marks must be between 1 and 1000, got {0}")]
    TotalMarksOutOfRange(f64),

    #[error("grade level must be between 7 and 13, got {0}")]
    InvalidGradeLevel(i64),

    #[error("unknown threshold field: {0}")]
    UnknownField(String),

    #[error("unknown track: {0}")]
    UnknownTrack(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeThreshold {
    pub min: f64,
    pub max: f64,
    pub label: String,
}

impl GradeThreshold {
    pub fn new(min: f64, max: f64, label: impl Into<String>) -> Self {
        Self {
            min,
            max,
            label: label.into(),
        }
    }
}

/// Scale used when a context has no list of its own.
pub fn default_scale() -> Vec<GradeThreshold> {
    vec![
        GradeThreshold::new(90.0, 100.0, "A+"),
        GradeThreshold::new(80.0, 89.0, "A"),
        GradeThreshold::new(70.0, 79.0, "B"),
        GradeThreshold::new(60.0, 69.0, "C"),
        GradeThreshold::new(50.0, 59.0, "D"),
        GradeThreshold::new(0.0, 49.0, "F"),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct GradeLevel(u8);

impl GradeLevel {
    pub fn new(level: i64) -> Result<Self, ThresholdError> {
        match u8::try_from(level) {
            Ok(v) if (MIN_GRADE_LEVEL..=MAX_GRADE_LEVEL).contains(&v) => Ok(Self(v)),
            _ => Err(ThresholdError::InvalidGradeLevel(level)),
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Senior levels split their scale into main/sub tracks.
    pub fn has_tracks(self) -> bool {
        self.0 >= FIRST_TRACKED_LEVEL
    }
}

impl TryFrom<u8> for GradeLevel {
    type Error = ThresholdError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(i64::from(value))
    }
}

impl From<GradeLevel> for u8 {
    fn from(value: GradeLevel) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Track {
    Main,
    Sub,
    #[default]
    Default,
}

impl Track {
    pub fn parse(s: &str) -> Result<Self, ThresholdError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "main" => Ok(Self::Main),
            "sub" => Ok(Self::Sub),
            "default" | "" => Ok(Self::Default),
            other => Err(ThresholdError::UnknownTrack(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdField {
    Min,
    Max,
    Label,
}

impl ThresholdField {
    pub fn parse(s: &str) -> Result<Self, ThresholdError> {
        match s {
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "label" => Ok(Self::Label),
            other => Err(ThresholdError::UnknownField(other.to_string())),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
            Self::Label => "label",
        }
    }
}

/// Threshold lists for one grade level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextThresholds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<Vec<GradeThreshold>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<Vec<GradeThreshold>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Vec<GradeThreshold>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_marks: Option<f64>,
}

impl ContextThresholds {
    fn list(&self, track: Track) -> Option<&[GradeThreshold]> {
        let list = match track {
            Track::Main => self.main.as_deref(),
            Track::Sub => self.sub.as_deref(),
            Track::Default => self.default.as_deref(),
        };
        list.filter(|l| !l.is_empty())
    }

    fn slot_mut(&mut self, track: Track) -> &mut Option<Vec<GradeThreshold>> {
        match track {
            Track::Main => &mut self.main,
            Track::Sub => &mut self.sub,
            Track::Default => &mut self.default,
        }
    }
}

/// Per-grade-level configuration, persisted as `{ "10": {...}, "12": {...} }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GradeThresholdConfig {
    pub levels: BTreeMap<GradeLevel, ContextThresholds>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectThresholds {
    #[serde(default)]
    pub criteria: Vec<GradeThreshold>,
    #[serde(default = "default_total_marks")]
    pub total_marks: f64,
}

fn default_total_marks() -> f64 {
    DEFAULT_TOTAL_MARKS
}

/// Per-subject configuration, persisted as `{ "<subjectId>": {criteria, totalMarks} }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectThresholdConfig {
    pub subjects: BTreeMap<String, SubjectThresholds>,
}

/// Resolves the list for a grade level and track.
///
/// Order of preference: the track's own list (senior levels only), the
/// level's default list, then [`default_scale`]. Empty lists count as absent,
/// so the result is never empty.
pub fn get_criteria(
    config: &GradeThresholdConfig,
    grade: GradeLevel,
    track: Track,
) -> Cow<'_, [GradeThreshold]> {
    if let Some(ctx) = config.levels.get(&grade) {
        if grade.has_tracks() && track != Track::Default {
            if let Some(list) = ctx.list(track) {
                return Cow::Borrowed(list);
            }
        }
        if let Some(list) = ctx.list(Track::Default) {
            return Cow::Borrowed(list);
        }
    }
    Cow::Owned(default_scale())
}

pub fn get_subject_criteria<'a>(
    config: &'a SubjectThresholdConfig,
    subject_id: &str,
) -> Cow<'a, [GradeThreshold]> {
    match config.subjects.get(subject_id) {
        Some(s) if !s.criteria.is_empty() => Cow::Borrowed(&s.criteria),
        _ => Cow::Owned(default_scale()),
    }
}

fn coerce_number(field: ThresholdField, value: &str) -> Result<f64, ThresholdError> {
    let trimmed = value.trim();
    // A cleared input box means zero.
    if trimmed.is_empty() {
        return Ok(0.0);
    }
    match trimmed.parse::<f64>() {
        Ok(n) if n.is_finite() => Ok(n),
        _ => Err(ThresholdError::InvalidNumber {
            field: field.name(),
            value: value.to_string(),
        }),
    }
}

/// Replaces one field of the band at `index`.
pub fn update_field(
    seq: &[GradeThreshold],
    index: usize,
    field: ThresholdField,
    value: &str,
) -> Result<Vec<GradeThreshold>, ThresholdError> {
    if index >= seq.len() {
        return Err(ThresholdError::IndexOutOfRange {
            index,
            len: seq.len(),
        });
    }
    let mut next = seq.to_vec();
    let band = &mut next[index];
    match field {
        ThresholdField::Min => band.min = coerce_number(field, value)?,
        ThresholdField::Max => band.max = coerce_number(field, value)?,
        ThresholdField::Label => band.label = value.to_string(),
    }
    Ok(next)
}

pub fn add_threshold(seq: &[GradeThreshold]) -> Vec<GradeThreshold> {
    let mut next = seq.to_vec();
    next.push(GradeThreshold::new(0.0, 10.0, "New"));
    next
}

pub fn remove_threshold(
    seq: &[GradeThreshold],
    index: usize,
) -> Result<Vec<GradeThreshold>, ThresholdError> {
    if seq.len() <= 1 {
        return Err(ThresholdError::CannotRemoveLastThreshold);
    }
    if index >= seq.len() {
        return Err(ThresholdError::IndexOutOfRange {
            index,
            len: seq.len(),
        });
    }
    let mut next = seq.to_vec();
    next.remove(index);
    Ok(next)
}

pub fn percent_of(mark: f64, total_marks: f64) -> String {
    if total_marks > 0.0 {
        let pct = mark / total_marks * 100.0;
        // Exact ties at one decimal are odd multiples of 0.25 and round away
        // from zero. Everything else formats from its exact binary value.
        let quarters = pct * 4.0;
        if quarters.fract() == 0.0 && quarters % 2.0 != 0.0 {
            format!("{:.1}", (pct * 10.0).round() / 10.0)
        } else {
            format!("{:.1}", pct)
        }
    } else {
        "0".to_string()
    }
}

pub fn validate_total_marks(total_marks: f64) -> Result<f64, ThresholdError> {
    if total_marks.is_finite() && (MIN_TOTAL_MARKS..=MAX_TOTAL_MARKS).contains(&total_marks) {
        Ok(total_marks)
    } else {
        Err(ThresholdError::TotalMarksOutOfRange(total_marks))
    }
}

/// First band, in list order, whose inclusive range holds `mark`.
pub fn grade_for(seq: &[GradeThreshold], mark: f64) -> Option<&GradeThreshold> {
    seq.iter().find(|b| b.min <= mark && mark <= b.max)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CoverageIssue {
    Inverted { index: usize },
    Overlap { first: usize, second: usize },
    Gap { from: f64, to: f64 },
}

/// Reports where `seq` fails to partition `[0, total_marks]`.
///
/// Marks are whole numbers here: a band ending at 49 and one starting at 50
/// are adjacent. Inverted bands (`min >= max`) are reported and then ignored
/// for gap and overlap checks.
pub fn coverage_issues(seq: &[GradeThreshold], total_marks: f64) -> Vec<CoverageIssue> {
    let mut issues = Vec::new();
    let mut order = Vec::with_capacity(seq.len());
    for (i, band) in seq.iter().enumerate() {
        if band.min >= band.max {
            issues.push(CoverageIssue::Inverted { index: i });
        } else {
            order.push(i);
        }
    }
    order.sort_by(|&a, &b| seq[a].min.total_cmp(&seq[b].min));

    // (index of the band reaching furthest, how far it reaches)
    let mut reach: Option<(usize, f64)> = None;
    for i in order {
        let band = &seq[i];
        match reach {
            None if band.min >= 1.0 => issues.push(CoverageIssue::Gap {
                from: 0.0,
                to: band.min - 1.0,
            }),
            None => {}
            Some((j, top)) if band.min <= top => {
                issues.push(CoverageIssue::Overlap { first: j, second: i })
            }
            Some((_, top)) if band.min > top + 1.0 => issues.push(CoverageIssue::Gap {
                from: top + 1.0,
                to: band.min - 1.0,
            }),
            Some(_) => {}
        }
        if reach.map_or(true, |(_, top)| band.max > top) {
            reach = Some((i, band.max));
        }
    }
    match reach {
        Some((_, top)) if top < total_marks => issues.push(CoverageIssue::Gap {
            from: top + 1.0,
            to: total_marks,
        }),
        None => issues.push(CoverageIssue::Gap {
            from: 0.0,
            to: total_marks,
        }),
        Some(_) => {}
    }
    issues
}

/// A grading context: a grade level (and track), or one subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Grade { level: GradeLevel, track: Track },
    Subject(String),
}

/// Everything the threshold editor holds for one school.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradingThresholds {
    #[serde(default)]
    pub grade_thresholds: GradeThresholdConfig,
    #[serde(default)]
    pub subject_thresholds: SubjectThresholdConfig,
}

impl GradingThresholds {
    pub fn criteria(&self, scope: &Scope) -> Cow<'_, [GradeThreshold]> {
        match scope {
            Scope::Grade { level, track } => get_criteria(&self.grade_thresholds, *level, *track),
            Scope::Subject(id) => get_subject_criteria(&self.subject_thresholds, id),
        }
    }

    pub fn total_marks(&self, scope: &Scope, fallback: f64) -> f64 {
        match scope {
            Scope::Grade { level, .. } => self
                .grade_thresholds
                .levels
                .get(level)
                .and_then(|c| c.total_marks)
                .unwrap_or(fallback),
            Scope::Subject(id) => self
                .subject_thresholds
                .subjects
                .get(id)
                .map(|s| s.total_marks)
                .unwrap_or(fallback),
        }
    }

    /// Replaces the list the scope edits. Junior levels only have a default list.
    pub fn set_criteria(&mut self, scope: &Scope, list: Vec<GradeThreshold>, fallback_total: f64) {
        match scope {
            Scope::Grade { level, track } => {
                let track = if level.has_tracks() {
                    *track
                } else {
                    Track::Default
                };
                let ctx = self.grade_thresholds.levels.entry(*level).or_default();
                *ctx.slot_mut(track) = Some(list);
            }
            Scope::Subject(id) => {
                self.subject_thresholds
                    .subjects
                    .entry(id.clone())
                    .or_insert_with(|| SubjectThresholds {
                        criteria: Vec::new(),
                        total_marks: fallback_total,
                    })
                    .criteria = list;
            }
        }
    }

    pub fn set_total_marks(&mut self, scope: &Scope, total_marks: f64) -> Result<(), ThresholdError> {
        let total_marks = validate_total_marks(total_marks)?;
        match scope {
            Scope::Grade { level, .. } => {
                self.grade_thresholds
                    .levels
                    .entry(*level)
                    .or_default()
                    .total_marks = Some(total_marks);
            }
            Scope::Subject(id) => {
                self.subject_thresholds
                    .subjects
                    .entry(id.clone())
                    .or_insert_with(|| SubjectThresholds {
                        criteria: Vec::new(),
                        total_marks,
                    })
                    .total_marks = total_marks;
            }
        }
        Ok(())
    }
}
