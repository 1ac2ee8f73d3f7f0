//! Advisory validation of standardized records.
//!
//! Every record is checked against the mandatory fields and type
//! constraints of its schema. Nothing is filtered out: the outcome only
//! describes what is wrong, and `meets_threshold` is a flag for the caller,
//! not a gate.

use crate::schema::{SchemaTag, StandardizedRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{info, warn};
use uuid::Uuid;

/// Highest valid `numero`.
pub const MAX_NUMERO: i64 = 32_767;

/// Descriptions shorter than this are flagged in the integrity report.
pub const SHORT_DESCRIPTION_CHARS: usize = 20;

/// Completeness at or above which the integrity status can be `good`.
const GOOD_COMPLETENESS: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Mandatory field empty.
    Missing,
    /// Value outside its allowed range.
    OutOfRange,
    /// Value present but not of the expected form.
    Malformed,
    /// Record variant differs from the run's schema.
    WrongSchema,
}

/// One problem with one field of one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaViolation {
    pub field: String,
    pub kind: ViolationKind,
    pub detail: String,
}

impl SchemaViolation {
    fn new(field: &str, kind: ViolationKind, detail: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.detail)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityStatus {
    Good,
    NeedsReview,
    Empty,
}

/// Field completeness and description quality across all records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub status: IntegrityStatus,
    /// Records with every mandatory field non-empty, over all records.
    pub completeness_rate: f64,
    pub complete_records: usize,
    pub total_records: usize,
    /// Mandatory field → records where it is empty. Only non-zero counts.
    pub missing_fields: BTreeMap<String, usize>,
    pub empty_descriptions: usize,
    pub short_descriptions: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub description_warnings: Vec<String>,
}

/// Result of the validation stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub schema: SchemaTag,
    /// `record_violations[i]` belongs to record `i`; empty when clean.
    pub record_violations: Vec<Vec<SchemaViolation>>,
    pub total_records: usize,
    pub valid_records: usize,
    /// `valid_records / total_records`, 0 for no records.
    pub confidence: f64,
    pub threshold: f64,
    pub meets_threshold: bool,
    pub integrity: IntegrityReport,
    /// `0.6 * confidence + 0.4 * completeness`, rounded to 3 decimals.
    pub quality_score: f64,
}

impl ValidationOutcome {
    pub fn violations_for(&self, record: usize) -> &[SchemaViolation] {
        self.record_violations
            .get(record)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn violation_count(&self) -> usize {
        self.record_violations.iter().map(Vec::len).sum()
    }
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

/// Weighted quality score from confidence and completeness.
pub fn quality_score(confidence: f64, completeness: f64) -> f64 {
    round3(0.6 * confidence + 0.4 * completeness)
}

fn is_blank(value: Option<&String>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}

/// Check one record against `schema`.
pub fn check_record(record: &StandardizedRecord, schema: SchemaTag) -> Vec<SchemaViolation> {
    if record.schema() != schema {
        return vec![SchemaViolation::new(
            "id",
            ViolationKind::WrongSchema,
            format!("{} record in a {} run", record.schema(), schema),
        )];
    }

    let mut violations = Vec::new();
    for field in schema.mandatory_fields() {
        if is_blank(record.text_field(field).as_ref()) {
            violations.push(SchemaViolation::new(field, ViolationKind::Missing, "empty"));
        }
    }

    if !record.id().trim().is_empty() && Uuid::parse_str(record.id()).is_err() {
        violations.push(SchemaViolation::new(
            "id",
            ViolationKind::Malformed,
            format!("'{}' is not a UUID", record.id()),
        ));
    }

    if let Some(r) = record.as_rag1() {
        if !(0..=MAX_NUMERO).contains(&r.numero) {
            violations.push(SchemaViolation::new(
                "numero",
                ViolationKind::OutOfRange,
                format!("{} is outside 0..={}", r.numero, MAX_NUMERO),
            ));
        }
    }

    if let Some(embedding) = record.embedding() {
        if embedding.is_empty() {
            violations.push(SchemaViolation::new(
                "embedding",
                ViolationKind::Malformed,
                "empty vector",
            ));
        } else if embedding.iter().any(|x| !x.is_finite()) {
            violations.push(SchemaViolation::new(
                "embedding",
                ViolationKind::Malformed,
                "non-finite component",
            ));
        }
    }
    violations
}

/// Field completeness and description checks.
pub fn check_integrity(records: &[StandardizedRecord], schema: SchemaTag) -> IntegrityReport {
    if records.is_empty() {
        return IntegrityReport {
            status: IntegrityStatus::Empty,
            completeness_rate: 0.0,
            complete_records: 0,
            total_records: 0,
            missing_fields: BTreeMap::new(),
            empty_descriptions: 0,
            short_descriptions: 0,
            description_warnings: Vec::new(),
        };
    }

    let descriptive = schema.descriptive_field();
    let mut missing_fields: BTreeMap<String, usize> = BTreeMap::new();
    let mut complete_records = 0;
    let mut empty_descriptions = 0;
    let mut short_descriptions = 0;

    for record in records {
        let mut complete = true;
        for field in schema.mandatory_fields() {
            if is_blank(record.text_field(field).as_ref()) {
                *missing_fields.entry(field.to_string()).or_default() += 1;
                complete = false;
            }
        }
        if complete {
            complete_records += 1;
        }

        match record.text_field(descriptive) {
            Some(d) if !d.is_empty() => {
                if d.chars().count() < SHORT_DESCRIPTION_CHARS {
                    short_descriptions += 1;
                }
            }
            _ => empty_descriptions += 1,
        }
    }

    let mut description_warnings = Vec::new();
    if empty_descriptions > 0 {
        description_warnings.push(format!("{empty_descriptions} records have an empty {descriptive}"));
    }
    if short_descriptions > 0 {
        description_warnings.push(format!(
            "{short_descriptions} records have a {descriptive} shorter than {SHORT_DESCRIPTION_CHARS} characters"
        ));
    }

    let completeness_rate = complete_records as f64 / records.len() as f64;
    let status = if completeness_rate >= GOOD_COMPLETENESS && description_warnings.is_empty() {
        IntegrityStatus::Good
    } else {
        IntegrityStatus::NeedsReview
    };

    IntegrityReport {
        status,
        completeness_rate,
        complete_records,
        total_records: records.len(),
        missing_fields,
        empty_descriptions,
        short_descriptions,
        description_warnings,
    }
}

/// Validate all records. Never drops or reorders a record.
pub fn validate(
    records: &[StandardizedRecord],
    schema: SchemaTag,
    threshold: f64,
) -> ValidationOutcome {
    let record_violations: Vec<Vec<SchemaViolation>> =
        records.iter().map(|r| check_record(r, schema)).collect();

    for (i, violations) in record_violations.iter().enumerate() {
        for v in violations {
            warn!("Record {}: {}", i, v);
        }
    }

    let total_records = records.len();
    let valid_records = record_violations.iter().filter(|v| v.is_empty()).count();
    let confidence = if total_records == 0 {
        0.0
    } else {
        valid_records as f64 / total_records as f64
    };
    let integrity = check_integrity(records, schema);
    let quality_score = quality_score(confidence, integrity.completeness_rate);

    info!(
        "Validation: {}/{} clean records, confidence {:.3}, quality {:.3}",
        valid_records, total_records, confidence, quality_score
    );

    ValidationOutcome {
        schema,
        record_violations,
        total_records,
        valid_records,
        confidence,
        threshold,
        meets_threshold: total_records > 0 && confidence >= threshold,
        integrity,
        quality_score,
    }
}
