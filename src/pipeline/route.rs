//! Schema routing: pick RAG1 or RAG2 and map columns onto its fields.
//!
//! Routing is hybrid. Column-name heuristics propose a candidate first; the
//! text capability is then asked to confirm or override it. The capability
//! verdict wins outright when it parses. When the call fails or the answer is
//! unusable, the heuristic candidate stands with confidence capped at 0.5 and
//! a `RoutingUncertainty` degradation is recorded.
//!
//! The field mapping always covers every content field of the chosen schema:
//! a field without a source column gets a derivation rule (row ordinal,
//! anchored images, source label) or an explicit default/null rule.

use crate::capability::answer::parse_json_answer;
use crate::capability::{AnalysisRequest, TextCapability};
use crate::config::MAX_ROUTING_SAMPLE_ROWS;
use crate::error::{CapabilityError, Degradation, DegradationKind};
use crate::pipeline::ingest::{normalize_column_name, RawTable, SourceKind};
use crate::pipeline::PipelineStage;
use crate::schema::SchemaTag;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Confidence ceiling when the capability verdict is unavailable.
pub const FALLBACK_CONFIDENCE_CAP: f64 = 0.5;

/// Average length above which an unmapped column is treated as free text.
const LONG_TEXT_AVG_CHARS: f64 = 50.0;

/// Where a target field's value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", content = "column", rename_all = "snake_case")]
pub enum FieldSource {
    /// Copy from a source column.
    Column(String),
    /// 1-based row ordinal (`numero`).
    RowOrdinal,
    /// Code derived from the ordinal, `ART0001` (`articulo_id`).
    OrdinalCode,
    /// Caption synthesized from the row's anchored images.
    AnchoredImages,
    /// Source kind label, `csv` or `xlsx` (`fuente`).
    SourceLabel,
    /// The schema's default value for the field.
    Default,
    /// Always null.
    Null,
}

impl FieldSource {
    pub fn column(&self) -> Option<&str> {
        match self {
            FieldSource::Column(c) => Some(c),
            _ => None,
        }
    }
}

/// Target field → source rule.
pub type FieldMapping = BTreeMap<String, FieldSource>;

/// Who made the final schema call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingSource {
    Capability,
    Heuristic,
    Forced,
}

/// Keyword hits per schema over the column names.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeuristicScores {
    pub rag1: usize,
    pub rag2: usize,
    pub candidate: SchemaTag,
    pub confidence: f64,
}

/// Output of the routing stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub schema: SchemaTag,
    pub mapping: FieldMapping,
    /// In [0, 1].
    pub confidence: f64,
    pub rationale: String,
    pub source: RoutingSource,
    pub heuristic: HeuristicScores,
}

impl RoutingDecision {
    pub fn source_for(&self, field: &str) -> &FieldSource {
        self.mapping.get(field).unwrap_or(&FieldSource::Null)
    }

    /// Fields copied straight from a column, field → column.
    pub fn direct_columns(&self) -> BTreeMap<String, String> {
        self.mapping
            .iter()
            .filter_map(|(f, s)| s.column().map(|c| (f.clone(), c.to_string())))
            .collect()
    }
}

/// Routing decision plus what degraded on the way.
#[derive(Debug, Clone)]
pub struct RoutingOutcome {
    pub decision: RoutingDecision,
    pub degradations: Vec<Degradation>,
}

/// Inputs the router needs beyond the table.
#[derive(Debug, Clone, Copy)]
pub struct RouterSettings {
    pub sample_rows: usize,
    pub forced_schema: Option<SchemaTag>,
}

// ── Heuristics ───────────────────────────────────────────────────────────

const RAG1_KEYWORDS: &[&str] = &[
    "titulo", "texto", "articulo", "numero", "ley", "title", "text", "article", "law",
];
const RAG2_KEYWORDS: &[&str] = &[
    "descripcion",
    "servicio",
    "categoria",
    "subcategoria",
    "ticket",
    "description",
    "service",
    "category",
    "subcategory",
];

/// Count schema keywords present in any column name.
///
/// RAG1 wins only with a strictly higher score.
pub fn heuristic_scores(columns: &[String]) -> HeuristicScores {
    let hits = |keywords: &[&str]| {
        keywords
            .iter()
            .filter(|kw| columns.iter().any(|c| c.contains(*kw)))
            .count()
    };
    let rag1 = hits(RAG1_KEYWORDS);
    let rag2 = hits(RAG2_KEYWORDS);
    let candidate = if rag1 > rag2 {
        SchemaTag::Rag1
    } else {
        SchemaTag::Rag2
    };
    let total = rag1 + rag2;
    let confidence = if total == 0 {
        0.5
    } else {
        rag1.max(rag2) as f64 / total as f64
    };
    HeuristicScores {
        rag1,
        rag2,
        candidate,
        confidence,
    }
}

/// Column-name fragments per target field, in priority order.
fn mapping_rules(schema: SchemaTag) -> &'static [(&'static str, &'static str)] {
    match schema {
        SchemaTag::Rag1 => &[
            ("articulo", "articulo_id"),
            ("article", "articulo_id"),
            ("doc_ref", "articulo_id"),
            ("doc_id", "articulo_id"),
            ("id", "articulo_id"),
            ("ref", "articulo_id"),
            ("tipo", "tipo"),
            ("type", "tipo"),
            ("category", "tipo"),
            ("categoria", "tipo"),
            ("numero", "numero"),
            ("num", "numero"),
            ("section", "numero"),
            ("seccion", "numero"),
            ("titulo", "titulo"),
            ("title", "titulo"),
            ("header", "titulo"),
            ("encabezado", "titulo"),
            ("name", "titulo"),
            ("nombre", "titulo"),
            ("body_content", "texto"),
            ("body", "texto"),
            ("content", "texto"),
            ("texto", "texto"),
            ("text", "texto"),
            ("contenido", "texto"),
            ("descripcion", "texto"),
            ("description", "texto"),
            ("detalle", "texto"),
            ("detail", "texto"),
            ("keywords", "keywords"),
            ("tags", "keywords"),
            ("palabras_clave", "keywords"),
            ("etiquetas", "keywords"),
        ],
        SchemaTag::Rag2 => &[
            ("body_content", "descripcion"),
            ("body", "descripcion"),
            ("descripcion", "descripcion"),
            ("description", "descripcion"),
            ("texto", "descripcion"),
            ("text", "descripcion"),
            ("contenido", "descripcion"),
            ("detalle", "descripcion"),
            ("detail", "descripcion"),
            ("subcategoria", "subcategoria"),
            ("subcategory", "subcategoria"),
            ("tipo", "tipo"),
            ("type", "tipo"),
            ("categoria", "categoria"),
            ("category", "categoria"),
            ("servicio", "servicio"),
            ("service", "servicio"),
            ("fuente", "fuente"),
            ("source", "fuente"),
            ("origen", "fuente"),
        ],
    }
}

/// Short fragments must match a whole `_`-separated token.
fn fragment_matches(column: &str, fragment: &str) -> bool {
    if fragment.len() <= 3 {
        column.split('_').any(|t| t == fragment)
    } else {
        column.contains(fragment)
    }
}

/// Rule for a field no column claimed.
fn fallback_source(schema: SchemaTag, field: &str) -> FieldSource {
    match (schema, field) {
        (SchemaTag::Rag1, "numero") => FieldSource::RowOrdinal,
        (SchemaTag::Rag1, "articulo_id") => FieldSource::OrdinalCode,
        (SchemaTag::Rag1, "keywords") => FieldSource::Null,
        (SchemaTag::Rag2, "fuente") => FieldSource::SourceLabel,
        _ => FieldSource::Default,
    }
}

/// Build the field mapping for `schema` from column names and values.
///
/// Each column goes to the first rule it matches; each field keeps the
/// first column (in column order) that matched it. Then one unmapped
/// long-text column may claim the descriptive field.
pub fn build_mapping(schema: SchemaTag, table: &RawTable) -> FieldMapping {
    let mut mapping = FieldMapping::new();

    for column in &table.columns {
        let Some((_, field)) = mapping_rules(schema)
            .iter()
            .find(|(fragment, _)| fragment_matches(column, fragment))
        else {
            continue;
        };
        mapping
            .entry(field.to_string())
            .or_insert_with(|| FieldSource::Column(column.clone()));
    }

    let descriptive = schema.descriptive_field();
    if !mapping.contains_key(descriptive) {
        let claimed: Vec<&str> = mapping.values().filter_map(FieldSource::column).collect();
        let long_text = table
            .columns
            .iter()
            .filter(|c| !claimed.contains(&c.as_str()))
            .find(|c| average_length(table, c).is_some_and(|avg| avg > LONG_TEXT_AVG_CHARS));
        if let Some(column) = long_text {
            info!("Auto-mapped long-text column '{}' to {}", column, descriptive);
            mapping.insert(descriptive.to_string(), FieldSource::Column(column.clone()));
        }
    }

    if schema == SchemaTag::Rag1 {
        mapping.insert("image_caption".into(), FieldSource::AnchoredImages);
    }
    for field in schema.content_fields() {
        mapping
            .entry(field.to_string())
            .or_insert_with(|| fallback_source(schema, field));
    }
    mapping
}

/// Mean length of the first three non-empty values of a column.
fn average_length(table: &RawTable, column: &str) -> Option<f64> {
    let col = table.column_index(column)?;
    let lengths: Vec<usize> = table
        .rows
        .iter()
        .map(|r| r.get(col))
        .filter(|v| !v.is_empty())
        .take(3)
        .map(|v| v.to_string().chars().count())
        .collect();
    if lengths.is_empty() {
        None
    } else {
        Some(lengths.iter().sum::<usize>() as f64 / lengths.len() as f64)
    }
}

// ── Capability verdict ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RoutingVerdict {
    #[serde(alias = "rag", alias = "suggested_rag", alias = "target_rag")]
    schema: String,
    #[serde(default, alias = "reason", alias = "razon")]
    rationale: Option<String>,
    #[serde(default, alias = "nivel_confianza")]
    confidence: Option<f64>,
    #[serde(default)]
    column_mapping: BTreeMap<String, serde_json::Value>,
}

fn parse_verdict(raw: &str) -> Result<(SchemaTag, RoutingVerdict), CapabilityError> {
    let verdict: RoutingVerdict = parse_json_answer(raw)?;
    let schema = verdict
        .schema
        .parse::<SchemaTag>()
        .map_err(|detail| CapabilityError::Unparsable { detail })?;
    Ok((schema, verdict))
}

/// Apply verdict column overrides that name a known field and an existing column.
fn apply_overrides(
    schema: SchemaTag,
    mapping: &mut FieldMapping,
    overrides: &BTreeMap<String, serde_json::Value>,
    table: &RawTable,
) {
    for (field, value) in overrides {
        let field = field.trim();
        if !schema.is_content_field(field) || field == "image_caption" {
            debug!("Ignoring mapping override for unknown field '{}'", field);
            continue;
        }
        let Some(column) = value.as_str().map(normalize_column_name) else {
            continue;
        };
        if table.column_index(&column).is_none() {
            debug!("Ignoring mapping override {} → '{}': no such column", field, column);
            continue;
        }
        mapping.insert(field.to_string(), FieldSource::Column(column));
    }
}

// ── Router ───────────────────────────────────────────────────────────────

/// Decide the target schema and field mapping for a table.
///
/// Never fails: a failed or unusable capability call degrades to the
/// heuristic candidate.
pub async fn route(
    table: &RawTable,
    source_kind: SourceKind,
    image_count: usize,
    text: &dyn TextCapability,
    settings: RouterSettings,
) -> RoutingOutcome {
    let heuristic = heuristic_scores(&table.columns);
    info!(
        "Routing heuristics: rag1={} rag2={} → {}",
        heuristic.rag1, heuristic.rag2, heuristic.candidate
    );

    if let Some(schema) = settings.forced_schema {
        info!("Schema forced to {}", schema);
        return RoutingOutcome {
            decision: RoutingDecision {
                schema,
                mapping: build_mapping(schema, table),
                confidence: 1.0,
                rationale: "schema forced by configuration".into(),
                source: RoutingSource::Forced,
                heuristic,
            },
            degradations: Vec::new(),
        };
    }

    let request = AnalysisRequest {
        source_kind: source_kind.label().to_string(),
        columns: table.columns.clone(),
        sample: table.sample(settings.sample_rows.min(MAX_ROUTING_SAMPLE_ROWS)),
        heuristic_schema: heuristic.candidate,
        image_count,
    };

    let verdict = match text.analyze(&request).await {
        Ok(raw) => parse_verdict(&raw),
        Err(e) => Err(e),
    };

    match verdict {
        Ok((schema, verdict)) => {
            let agrees = schema == heuristic.candidate;
            let confidence = verdict
                .confidence
                .filter(|c| c.is_finite())
                .map(|c| c.clamp(0.0, 1.0))
                .unwrap_or(if agrees { 1.0 } else { 0.75 });
            if !agrees {
                info!(
                    "Capability verdict {} overrides heuristic candidate {}",
                    schema, heuristic.candidate
                );
            }
            let mut mapping = build_mapping(schema, table);
            apply_overrides(schema, &mut mapping, &verdict.column_mapping, table);
            RoutingOutcome {
                decision: RoutingDecision {
                    schema,
                    mapping,
                    confidence,
                    rationale: verdict
                        .rationale
                        .unwrap_or_else(|| format!("capability chose {schema}")),
                    source: RoutingSource::Capability,
                    heuristic,
                },
                degradations: Vec::new(),
            }
        }
        Err(e) => {
            let degradation = Degradation::new(
                DegradationKind::RoutingUncertainty,
                PipelineStage::Routing,
                format!("routing verdict unavailable, using heuristic candidate: {e}"),
            );
            warn!("{}", degradation);
            let schema = heuristic.candidate;
            RoutingOutcome {
                decision: RoutingDecision {
                    schema,
                    mapping: build_mapping(schema, table),
                    confidence: heuristic.confidence.min(FALLBACK_CONFIDENCE_CAP),
                    rationale: format!(
                        "heuristic: {} rag1 and {} rag2 column keywords",
                        heuristic.rag1, heuristic.rag2
                    ),
                    source: RoutingSource::Heuristic,
                    heuristic,
                },
                degradations: vec![degradation],
            }
        }
    }
}
