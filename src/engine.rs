use chrono::NaiveDate;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

pub const EVALUACION_SLOTS: usize = 8;
pub const PRACTICA_SLOTS: usize = 4;
pub const PARCIAL_SLOTS: usize = 2;

/// Marks run on the 0..=20 scale; 13 passes.
pub const MAX_SCORE: f64 = 20.0;
pub const PASSING_SCORE: f64 = 13.0;

/// Half-up 2-decimal rounding used for every published average:
/// `Int(100*x + 0.5) / 100`.
pub fn round_off_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Evaluaciones,
    Practicas,
    Parciales,
}

impl Category {
    pub const ALL: [Category; 3] = [
        Category::Evaluaciones,
        Category::Practicas,
        Category::Parciales,
    ];

    pub fn slot_count(self) -> usize {
        match self {
            Category::Evaluaciones => EVALUACION_SLOTS,
            Category::Practicas => PRACTICA_SLOTS,
            Category::Parciales => PARCIAL_SLOTS,
        }
    }

    pub fn weight(self) -> f64 {
        match self {
            Category::Evaluaciones => 0.10,
            Category::Practicas => 0.30,
            Category::Parciales => 0.60,
        }
    }

    /// Singular stem of the wire field names ("evaluacion3", "parcial1", ...).
    pub fn field_prefix(self) -> &'static str {
        match self {
            Category::Evaluaciones => "evaluacion",
            Category::Practicas => "practica",
            Category::Parciales => "parcial",
        }
    }
}

/// Typed address of one grade slot. The wire format and the store key grades
/// by name (`evaluacion1..8`, `practica1..4`, `parcial1..2`); inside the
/// engine a field is a category plus a 0-based slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScoreField {
    category: Category,
    slot: usize,
}

impl ScoreField {
    pub fn new(category: Category, slot: usize) -> Option<ScoreField> {
        if slot < category.slot_count() {
            Some(ScoreField { category, slot })
        } else {
            None
        }
    }

    /// Parses a wire name such as "evaluacion3"; slot numbers are 1-based on
    /// the wire.
    pub fn parse(name: &str) -> Option<ScoreField> {
        let trimmed = name.trim().to_ascii_lowercase();
        for category in Category::ALL {
            let Some(rest) = trimmed.strip_prefix(category.field_prefix()) else {
                continue;
            };
            let n: usize = rest.parse().ok()?;
            if n >= 1 && n <= category.slot_count() {
                return ScoreField::new(category, n - 1);
            }
            return None;
        }
        None
    }

    pub fn name(self) -> String {
        format!("{}{}", self.category.field_prefix(), self.slot + 1)
    }

    pub fn category(self) -> Category {
        self.category
    }

    /// All 14 fields in fixed wire order.
    pub fn all() -> impl Iterator<Item = ScoreField> {
        Category::ALL.into_iter().flat_map(|category| {
            (0..category.slot_count()).map(move |slot| ScoreField { category, slot })
        })
    }
}

/// Raw marks of one student in one course. `None` means no grade entered;
/// that is not the same thing as a grade of zero.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GradeRecord {
    pub evaluaciones: [Option<f64>; EVALUACION_SLOTS],
    pub practicas: [Option<f64>; PRACTICA_SLOTS],
    pub parciales: [Option<f64>; PARCIAL_SLOTS],
}

impl GradeRecord {
    pub fn get(&self, field: ScoreField) -> Option<f64> {
        self.slots(field.category)[field.slot]
    }

    pub fn set(&mut self, field: ScoreField, value: Option<f64>) {
        self.slots_mut(field.category)[field.slot] = value;
    }

    pub fn slots(&self, category: Category) -> &[Option<f64>] {
        match category {
            Category::Evaluaciones => &self.evaluaciones,
            Category::Practicas => &self.practicas,
            Category::Parciales => &self.parciales,
        }
    }

    fn slots_mut(&mut self, category: Category) -> &mut [Option<f64>] {
        match category {
            Category::Evaluaciones => &mut self.evaluaciones,
            Category::Practicas => &mut self.practicas,
            Category::Parciales => &mut self.parciales,
        }
    }

    /// Copies every defined field of `other` over this record; fields `other`
    /// leaves empty keep their current value.
    pub fn merge_defined(&mut self, other: &GradeRecord) {
        for field in ScoreField::all() {
            if let Some(v) = other.get(field) {
                self.set(field, Some(v));
            }
        }
    }

    pub fn defined_fields(&self) -> impl Iterator<Item = (ScoreField, f64)> + '_ {
        ScoreField::all().filter_map(|field| self.get(field).map(|v| (field, v)))
    }

    pub fn is_empty(&self) -> bool {
        self.defined_fields().next().is_none()
    }
}

/// One loaded grade row: the unit the store hands back per (student, course).
#[derive(Debug, Clone)]
pub struct GradeRow {
    pub student_id: String,
    pub record: GradeRecord,
}

/// Last-fetched, store-confirmed grade state, one record per student.
pub type Baseline = BTreeMap<String, GradeRecord>;

/// Pending edits not yet persisted, one record per student. Ordered map so
/// payload emission enumerates students deterministically.
pub type EditOverlay = BTreeMap<String, GradeRecord>;

/// Collapses loaded rows into one record per student: the union of every
/// defined field, last value winning when rows repeat a field.
pub fn flatten_baseline(rows: &[GradeRow]) -> Baseline {
    let mut out = Baseline::new();
    for row in rows {
        out.entry(row.student_id.clone())
            .or_default()
            .merge_defined(&row.record);
    }
    out
}

/// Seeds the editing overlay: each student starts from their last loaded row
/// and diverges from there as edits arrive.
pub fn seed_overlay(rows: &[GradeRow]) -> EditOverlay {
    let mut out = EditOverlay::new();
    for row in rows {
        out.insert(row.student_id.clone(), row.record);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GradeStatus {
    SinNota,
    Aprobado,
    Desaprobado,
}

impl GradeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GradeStatus::SinNota => "SIN_NOTA",
            GradeStatus::Aprobado => "APROBADO",
            GradeStatus::Desaprobado => "DESAPROBADO",
        }
    }
}

/// Mean of the entered marks in one category, or `None` when the category has
/// none. A slot holding a literal 0 counts as not entered, so an all-zero
/// category has no average; at this layer an earned zero cannot be told apart
/// from a blank.
pub fn category_average(record: &GradeRecord, category: Category) -> Option<f64> {
    let mut sum = 0.0_f64;
    let mut count = 0usize;
    for slot in record.slots(category) {
        if let Some(v) = slot {
            if *v > 0.0 {
                sum += v;
                count += 1;
            }
        }
    }
    if count == 0 {
        None
    } else {
        Some(round_off_2_decimals(sum / count as f64))
    }
}

/// Weighted blend of the category averages (evaluaciones 10%, practicas 30%,
/// parciales 60%). The weights renormalize over the categories that have at
/// least one entered mark: a student graded only on parciales averages
/// exactly their parcial average, not 60% of it.
pub fn overall_average(record: &GradeRecord) -> Option<f64> {
    let mut weighted_sum = 0.0_f64;
    let mut weight_total = 0.0_f64;
    for category in Category::ALL {
        if let Some(avg) = category_average(record, category) {
            weighted_sum += avg * category.weight();
            weight_total += category.weight();
        }
    }
    if weight_total > 0.0 {
        Some(round_off_2_decimals(weighted_sum / weight_total))
    } else {
        None
    }
}

pub fn derive_status(average: Option<f64>) -> GradeStatus {
    match average {
        None => GradeStatus::SinNota,
        Some(avg) if avg >= PASSING_SCORE => GradeStatus::Aprobado,
        Some(_) => GradeStatus::Desaprobado,
    }
}

/// Empty input is valid (it clears the slot); anything else must parse as a
/// real number inside [0, 20].
pub fn validate_score_input(raw: &str) -> bool {
    if raw.is_empty() {
        return true;
    }
    match raw.parse::<f64>() {
        Ok(v) => v.is_finite() && (0.0..=MAX_SCORE).contains(&v),
        Err(_) => false,
    }
}

/// Keystroke normalization applied before validation: drop everything but
/// digits and the first dot, cap values above 20 at "20", and left-pad a
/// single-digit whole-number entry ("7" becomes "07").
pub fn format_score_input(raw: &str) -> String {
    let mut out = String::new();
    let mut seen_dot = false;
    for ch in raw.chars() {
        if ch.is_ascii_digit() {
            out.push(ch);
        } else if ch == '.' && !seen_dot {
            seen_dot = true;
            out.push('.');
        }
    }
    if let Ok(v) = out.parse::<f64>() {
        if v > MAX_SCORE {
            out = "20".to_string();
        }
    }
    if !out.contains('.') && out.len() == 1 {
        out.insert(0, '0');
    }
    out
}

/// Formats and validates `raw`, then writes the slot: a number on success, a
/// cleared slot for the empty string. Returns false and leaves the overlay
/// untouched when the input does not survive validation; user feedback is the
/// caller's job.
pub fn apply_edit(
    overlay: &mut EditOverlay,
    student_id: &str,
    field: ScoreField,
    raw: &str,
) -> bool {
    let formatted = format_score_input(raw);
    if !validate_score_input(&formatted) {
        return false;
    }
    // A validated non-empty string always parses; empty clears the slot.
    let value = formatted.parse::<f64>().ok();
    overlay
        .entry(student_id.to_string())
        .or_default()
        .set(field, value);
    true
}

/// True when any overlay field of this student diverges from the baseline:
/// either a value where the baseline has none, or two values that differ
/// numerically. Re-entering the baseline value reports false, and clearing a
/// slot never registers (only defined values are ever sent back).
pub fn has_unsaved_changes(overlay: &EditOverlay, baseline: &Baseline, student_id: &str) -> bool {
    let Some(edited) = overlay.get(student_id) else {
        return false;
    };
    let base = baseline.get(student_id);
    ScoreField::all().any(|field| {
        let Some(value) = edited.get(field) else {
            return false;
        };
        match base.and_then(|b| b.get(field)) {
            None => true,
            Some(prev) => value != prev,
        }
    })
}

/// Payload unit for one student's changed grades.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveRecord {
    pub student_id: String,
    pub course_id: String,
    pub evaluation_date: NaiveDate,
    pub grades: GradeRecord,
}

impl Serialize for SaveRecord {
    /// Flat wire shape: identity keys first, then only the defined grade
    /// fields by name. Fields the overlay holds no value for are absent, not
    /// null.
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let defined: Vec<(ScoreField, f64)> = self.grades.defined_fields().collect();
        let mut map = serializer.serialize_map(Some(3 + defined.len()))?;
        map.serialize_entry("studentId", &self.student_id)?;
        map.serialize_entry("courseId", &self.course_id)?;
        map.serialize_entry("evaluationDate", &self.evaluation_date.to_string())?;
        for (field, value) in defined {
            map.serialize_entry(&field.name(), &value)?;
        }
        map.end()
    }
}

/// One record per student with unsaved changes, carrying every overlay field
/// that holds a value. `student_ids` narrows the sweep for single-row saves;
/// `None` walks the whole overlay. Nothing changed means an empty vec, which
/// callers must treat as a successful no-op.
pub fn build_bulk_save_payload(
    overlay: &EditOverlay,
    baseline: &Baseline,
    course_id: &str,
    evaluation_date: NaiveDate,
    student_ids: Option<&[String]>,
) -> Vec<SaveRecord> {
    let ids: Vec<&str> = match student_ids {
        Some(subset) => subset.iter().map(|s| s.as_str()).collect(),
        None => overlay.keys().map(|s| s.as_str()).collect(),
    };

    let mut records = Vec::new();
    for student_id in ids {
        if !has_unsaved_changes(overlay, baseline, student_id) {
            continue;
        }
        let Some(edited) = overlay.get(student_id) else {
            continue;
        };
        records.push(SaveRecord {
            student_id: student_id.to_string(),
            course_id: course_id.to_string(),
            evaluation_date,
            grades: *edited,
        });
    }
    records
}

/// Mean of the defined per-student averages (one category or overall),
/// skipping students without one; `None` when nobody has an average.
pub fn course_average<I>(averages: I) -> Option<f64>
where
    I: IntoIterator<Item = Option<f64>>,
{
    let mut sum = 0.0_f64;
    let mut count = 0usize;
    for avg in averages.into_iter().flatten() {
        sum += avg;
        count += 1;
    }
    if count == 0 {
        None
    } else {
        Some(round_off_2_decimals(sum / count as f64))
    }
}
