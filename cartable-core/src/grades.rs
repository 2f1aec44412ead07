//! Grade aggregation engine.
//!
//! Every score is brought to a 20-point scale before averaging. Averages are two
//! levels deep: grades are averaged per subject, then subjects are averaged into
//! the global figure, so a subject with many small assessments weighs the same as
//! a subject with a single one. A subject without any gradable work has the
//! [`UNDEFINED_AVERAGE`] sentinel and is left out of the global average.
//!
//! Everything here is pure and synchronous.

use std::collections::HashMap;

use crate::model::{Grade, GradeScore, Subject, SubjectId};

/// Average of a subject that has no gradable work. Distinct from `0.0`.
pub const UNDEFINED_AVERAGE: f64 = -1.0;

const SCALE: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Which score of a grade an average is computed over.
pub enum ScoreTarget {
    /// The student's own score.
    Student,
    /// The class average.
    Average,
    /// The lowest score in the class.
    Minimum,
    /// The highest score in the class.
    Maximum,
}

impl ScoreTarget {
    fn score(self, grade: &Grade) -> &GradeScore {
        match self {
            ScoreTarget::Student => &grade.student_score,
            ScoreTarget::Average => &grade.average_score,
            ScoreTarget::Minimum => &grade.min_score,
            ScoreTarget::Maximum => &grade.max_score,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Average of one subject, keyed for [`influence`].
pub struct SubjectAverage {
    /// Subject the average belongs to.
    pub subject_id: SubjectId,
    /// Average on 20, or [`UNDEFINED_AVERAGE`].
    pub average: f64,
}

/// Whether `average` is a real average rather than the sentinel.
#[must_use]
pub fn is_defined(average: f64) -> bool {
    average >= 0.0
}

/// Round to two decimals.
#[must_use]
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// Grades with a missing or zero scale, or a score that is negative or not a
// number, cannot be normalized and are skipped.
fn normalized(grade: &Grade, target: ScoreTarget) -> Option<f64> {
    let value = target
        .score(grade)
        .as_value()
        .filter(|value| value.is_finite() && *value >= 0.0)?;
    let out_of = grade
        .out_of
        .as_value()
        .filter(|out_of| out_of.is_finite() && *out_of > 0.0)?;
    Some(value / out_of * SCALE)
}

fn mean<I: IntoIterator<Item = f64>>(values: I) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0_u32), |(sum, count), value| (sum + value, count + 1));
    (count > 0).then(|| sum / f64::from(count))
}

fn average_of<'g, I>(grades: I, target: ScoreTarget) -> f64
where
    I: IntoIterator<Item = &'g Grade>,
{
    mean(
        grades
            .into_iter()
            .filter_map(|grade| normalized(grade, target)),
    )
    .unwrap_or(UNDEFINED_AVERAGE)
}

/// Mean of `(value / out_of) * 20` over the grades whose `target` score is numeric.
///
/// Returns [`UNDEFINED_AVERAGE`] when no grade qualifies. Bonus and optional grades
/// are averaged like any other; filtering them is up to the caller.
#[must_use]
pub fn subject_average(grades: &[Grade], target: ScoreTarget) -> f64 {
    average_of(grades, target)
}

/// Mean of the defined subject averages, or `0.0` when no subject has one.
#[must_use]
pub fn global_average(subjects: &[Subject], target: ScoreTarget) -> f64 {
    global_from_averages(
        subjects
            .iter()
            .map(|subject| subject_average(&subject.grades, target)),
    )
}

fn global_from_averages<I: IntoIterator<Item = f64>>(averages: I) -> f64 {
    mean(averages.into_iter().filter(|average| is_defined(*average))).unwrap_or(0.0)
}

/// Student averages of every subject, in input order.
#[must_use]
pub fn subject_averages(subjects: &[Subject]) -> Vec<SubjectAverage> {
    subjects
        .iter()
        .map(|subject| SubjectAverage {
            subject_id: subject.id.clone(),
            average: subject_average(&subject.grades, ScoreTarget::Student),
        })
        .collect()
}

/// How much `grade` moves the global average: `global - global_without_grade`,
/// rounded to two decimals.
///
/// `subject_grades` are the grades of the subject `grade` belongs to (the grade
/// itself included). When removing the grade leaves its subject without gradable
/// work, the subject drops out of the recomputed global average altogether.
#[must_use]
pub fn influence(
    grade: &Grade,
    subject_grades: &[Grade],
    subject_averages: &[SubjectAverage],
    global: f64,
) -> f64 {
    let skipped = subject_grades
        .iter()
        .position(|candidate| candidate.id == grade.id);
    let remaining = subject_grades
        .iter()
        .enumerate()
        .filter(|(index, _)| Some(*index) != skipped)
        .map(|(_, candidate)| candidate);
    let subject_without = average_of(remaining, ScoreTarget::Student);

    let mut seen = false;
    let mut averages: Vec<f64> = subject_averages
        .iter()
        .map(|entry| {
            if entry.subject_id == grade.subject_id {
                seen = true;
                subject_without
            } else {
                entry.average
            }
        })
        .collect();
    if !seen {
        averages.push(subject_without);
    }

    round2(global - global_from_averages(averages))
}

/// Group a flat grade list into subjects by `subject_id`, in first-seen order,
/// with every average derived locally.
#[must_use]
pub fn build_subjects(grades: &[Grade]) -> Vec<Subject> {
    let mut order: Vec<SubjectId> = Vec::new();
    let mut grouped: HashMap<SubjectId, Vec<Grade>> = HashMap::new();
    for grade in grades {
        grouped
            .entry(grade.subject_id.clone())
            .or_insert_with(|| {
                order.push(grade.subject_id.clone());
                Vec::new()
            })
            .push(grade.clone());
    }

    order
        .into_iter()
        .filter_map(|id| {
            let grades = grouped.remove(&id)?;
            let name = grades
                .first()
                .map(|grade| grade.subject_name.clone())
                .unwrap_or_default();
            Some(Subject {
                student_average: as_score(subject_average(&grades, ScoreTarget::Student)),
                class_average: as_score(subject_average(&grades, ScoreTarget::Average)),
                minimum: as_score(subject_average(&grades, ScoreTarget::Minimum)),
                maximum: as_score(subject_average(&grades, ScoreTarget::Maximum)),
                out_of: GradeScore::value(SCALE),
                id,
                name,
                grades,
            })
        })
        .collect()
}

fn as_score(average: f64) -> GradeScore {
    if is_defined(average) {
        GradeScore::value(average)
    } else {
        GradeScore::unknown()
    }
}

/// Import-time subject key for providers that only report a raw subject label.
///
/// Keeps the part before the first `>`, folds case and French diacritics, and
/// drops anything that is not a letter or digit: `"MATHÉMATIQUES > Groupe 2"`
/// becomes `"mathematiques"`.
#[must_use]
pub fn normalize_subject_key(raw: &str) -> SubjectId {
    let head = raw.split('>').next().unwrap_or(raw);
    let mut key = String::with_capacity(head.len());
    for lowered in head.chars().flat_map(char::to_lowercase) {
        match fold_diacritic(lowered) {
            Folded::One(folded) if folded.is_alphanumeric() => key.push(folded),
            Folded::Two(first, second) => {
                key.push(first);
                key.push(second);
            }
            Folded::One(_) => {}
        }
    }
    SubjectId(key)
}

enum Folded {
    One(char),
    Two(char, char),
}

fn fold_diacritic(letter: char) -> Folded {
    let folded = match letter {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'ç' => 'c',
        'è' | 'é' | 'ê' | 'ë' => 'e',
        'ì' | 'í' | 'î' | 'ï' => 'i',
        'ñ' => 'n',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' => 'o',
        'ù' | 'ú' | 'û' | 'ü' => 'u',
        'ý' | 'ÿ' => 'y',
        'æ' => return Folded::Two('a', 'e'),
        'œ' => return Folded::Two('o', 'e'),
        other => other,
    };
    Folded::One(folded)
}
