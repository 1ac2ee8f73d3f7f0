//! Record standardization: one raw row in, one schema record out.
//!
//! ## Steps
//!
//! 1. **Rules**: one conceptualization call over the first rows proposes a
//!    per-field rule (source column, transform, default). Without an answer
//!    the routed mapping is used with default transforms.
//! 2. **Fields**: every row is run through the rules. A value that cannot be
//!    converted falls back to the field default.
//! 3. **Caption** (RAG1): see [`crate::pipeline::caption`].
//! 4. **Translation**: one call per record over its textual fields.
//!
//! Rows go through a single-worker [`CallQueue`], so calls for row `n + 1`
//! never start before row `n` is finished. No failure here aborts a record:
//! each one becomes a [`Degradation`] and the record keeps its best value.

use crate::capability::answer::parse_json_answer;
use crate::capability::{
    ConceptualizationRequest, TextCapability, TranslationRequest, VisionCapability,
};
use crate::error::{CapabilityError, Degradation, DegradationKind};
use crate::pipeline::caption::synthesize_caption;
use crate::pipeline::images::ImageAnchorMap;
use crate::pipeline::ingest::{normalize_column_name, RawTable, RawValue, SourceKind};
use crate::pipeline::queue::CallQueue;
use crate::pipeline::route::{FieldSource, RoutingDecision};
use crate::pipeline::PipelineStage;
use crate::progress::PipelineProgressCallback;
use crate::schema::{
    default_for, new_record_id, Rag1Record, Rag2Record, SchemaTag, StandardizedRecord,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

// ── Rules ────────────────────────────────────────────────────────────────

/// Value conversion applied to a non-empty source value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    /// Trimmed text.
    Copy,
    /// Text exactly as read.
    CopyFull,
    /// Trimmed text; an empty source gives null instead of the default.
    CopyOrNull,
    /// Integer; non-integral values fall back to the default.
    ToInteger,
    /// `a; b,c` → `a, b, c`.
    JoinTags,
}

impl Transform {
    /// Parse a transform name, accepting the Spanish rule vocabulary.
    /// Unknown names are `Copy`.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "copy_full" | "copiar_completo_sin_resumir" => Transform::CopyFull,
            "copy_or_null" | "copiar_si_existe_sino_null" => Transform::CopyOrNull,
            "to_integer" | "convertir_a_entero" => Transform::ToInteger,
            "join_tags" | "separar_por_punto_coma_unir_con_coma" => Transform::JoinTags,
            _ => Transform::Copy,
        }
    }

    /// Transform used for `field` when no rule names one.
    pub fn default_for(field: &str) -> Self {
        match field {
            "numero" => Transform::ToInteger,
            "keywords" => Transform::JoinTags,
            "texto" | "descripcion" => Transform::CopyFull,
            _ => Transform::Copy,
        }
    }
}

/// How one target field is synthesized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    pub source: FieldSource,
    pub transform: Transform,
    /// Replaces the schema default when the source is empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Target field → rule.
pub type RuleSet = BTreeMap<String, FieldRule>;

/// Where the rule set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOrigin {
    Conceptualization,
    DirectMapping,
}

/// Rules straight from the routed mapping.
pub fn direct_rules(decision: &RoutingDecision) -> RuleSet {
    decision
        .mapping
        .iter()
        .map(|(field, source)| {
            (
                field.clone(),
                FieldRule {
                    source: source.clone(),
                    transform: Transform::default_for(field),
                    default: None,
                },
            )
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct RuleAnswer {
    #[serde(alias = "reglas_transformacion", alias = "transformation_rules")]
    rules: BTreeMap<String, ProposedRule>,
}

#[derive(Debug, Deserialize)]
struct ProposedRule {
    #[serde(default, alias = "columna_origen")]
    source_column: Option<String>,
    #[serde(default, alias = "transformacion")]
    transform: Option<String>,
    #[serde(default, alias = "valor_por_defecto")]
    default: Option<serde_json::Value>,
}

fn value_to_default(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

/// Merge proposed rules over the direct rules.
///
/// Rules for unknown fields, for `image_caption`, or naming a column the
/// table does not have are ignored. A rule with no source column keeps the
/// routed source and only changes the transform and default.
fn merge_rules(
    schema: SchemaTag,
    mut rules: RuleSet,
    proposed: BTreeMap<String, ProposedRule>,
    table: &RawTable,
) -> RuleSet {
    for (field, rule) in proposed {
        let field = field.trim().to_string();
        if !schema.is_content_field(&field) || field == "image_caption" {
            debug!("Ignoring rule for unknown field '{}'", field);
            continue;
        }
        let source = match rule.source_column.as_deref().map(normalize_column_name) {
            Some(column) if !column.is_empty() => {
                if table.column_index(&column).is_none() {
                    debug!("Ignoring rule {} ← '{}': no such column", field, column);
                    continue;
                }
                FieldSource::Column(column)
            }
            _ => rules
                .get(&field)
                .map(|r| r.source.clone())
                .unwrap_or(FieldSource::Default),
        };
        let transform = rule
            .transform
            .as_deref()
            .map(Transform::parse)
            .unwrap_or_else(|| Transform::default_for(&field));
        let default = rule.default.and_then(value_to_default);
        rules.insert(
            field,
            FieldRule {
                source,
                transform,
                default,
            },
        );
    }
    rules
}

/// Ask for transformation rules; fall back to the direct mapping.
pub async fn conceptualize(
    table: &RawTable,
    decision: &RoutingDecision,
    text: &dyn TextCapability,
    sample_rows: usize,
) -> (RuleSet, RuleOrigin, Option<Degradation>) {
    let direct = direct_rules(decision);
    let request = ConceptualizationRequest {
        schema: decision.schema,
        columns: table.columns.clone(),
        sample: table.sample(sample_rows),
        mapping: decision.direct_columns(),
    };

    let answer = match text.conceptualize(&request).await {
        Ok(raw) => parse_json_answer::<RuleAnswer>(&raw),
        Err(e) => Err(e),
    };
    match answer {
        Ok(answer) => {
            info!("Conceptualization returned {} field rules", answer.rules.len());
            let rules = merge_rules(decision.schema, direct, answer.rules, table);
            (rules, RuleOrigin::Conceptualization, None)
        }
        Err(e) => {
            let d = Degradation::new(
                DegradationKind::FieldSynthesisFailure,
                PipelineStage::Standardizing,
                format!("no transformation rules, using direct mapping: {e}"),
            );
            warn!("{}", d);
            (direct, RuleOrigin::DirectMapping, Some(d))
        }
    }
}

// ── Field synthesis ──────────────────────────────────────────────────────

/// A synthesized field value before record assembly.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Int(i64),
    Null,
}

impl FieldValue {
    fn into_text(self) -> Option<String> {
        match self {
            FieldValue::Text(s) => Some(s),
            FieldValue::Int(i) => Some(i.to_string()),
            FieldValue::Null => None,
        }
    }
}

/// Per-row inputs to field synthesis.
#[derive(Debug, Clone, Copy)]
struct RowContext<'a> {
    schema: SchemaTag,
    table: &'a RawTable,
    row: usize,
    source_kind: SourceKind,
}

impl RowContext<'_> {
    fn ordinal(&self) -> i64 {
        self.row as i64 + 1
    }

    fn ordinal_code(&self) -> String {
        format!("ART{:04}", self.ordinal())
    }

    /// Value used when the source is empty or unusable.
    fn fallback(&self, field: &str, rule_default: Option<&str>) -> FieldValue {
        if let Some(d) = rule_default {
            if field != "numero" {
                return FieldValue::Text(d.to_string());
            }
            if let Some(n) = parse_integer(d) {
                return FieldValue::Int(n);
            }
        }
        match field {
            "numero" => FieldValue::Int(self.ordinal()),
            "articulo_id" => FieldValue::Text(self.ordinal_code()),
            "fuente" => FieldValue::Text(self.source_kind.label().to_string()),
            _ => default_for(self.schema, field)
                .map(|d| FieldValue::Text(d.to_string()))
                .unwrap_or(FieldValue::Null),
        }
    }
}

fn parse_integer(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Ok(i) = s.parse::<i64>() {
        return Some(i);
    }
    match s.parse::<f64>() {
        Ok(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Some(f as i64),
        _ => None,
    }
}

fn join_tags(s: &str) -> String {
    let sep = if s.contains(';') { ';' } else { ',' };
    s.split(sep)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Apply `transform` to a non-empty raw value.
fn apply_transform(raw: &RawValue, transform: Transform) -> Result<FieldValue, String> {
    match transform {
        Transform::Copy | Transform::CopyOrNull => {
            Ok(FieldValue::Text(raw.to_string().trim().to_string()))
        }
        Transform::CopyFull => Ok(FieldValue::Text(raw.to_string())),
        Transform::JoinTags => Ok(FieldValue::Text(join_tags(&raw.to_string()))),
        Transform::ToInteger => match raw {
            RawValue::Int(i) => Ok(FieldValue::Int(*i)),
            RawValue::Float(f) => parse_integer(&f.to_string())
                .map(FieldValue::Int)
                .ok_or_else(|| format!("{f} is not an integer")),
            other => parse_integer(&other.to_string())
                .map(FieldValue::Int)
                .ok_or_else(|| format!("'{other}' is not an integer")),
        },
    }
}

/// Synthesize one field. Returns the value and, when the source value had
/// to be discarded, why.
fn synthesize_field(
    ctx: &RowContext<'_>,
    field: &str,
    rule: &FieldRule,
) -> (FieldValue, Option<String>) {
    let default = rule.default.as_deref();
    match &rule.source {
        FieldSource::Column(column) => {
            let raw = ctx.table.value(ctx.row, column).unwrap_or(&RawValue::Empty);
            if raw.is_empty() {
                return if rule.transform == Transform::CopyOrNull {
                    (FieldValue::Null, None)
                } else {
                    (ctx.fallback(field, default), None)
                };
            }
            match apply_transform(raw, rule.transform) {
                Ok(FieldValue::Text(s)) if s.is_empty() => (ctx.fallback(field, default), None),
                Ok(v) => (v, None),
                Err(reason) => (
                    ctx.fallback(field, default),
                    Some(format!("{field} from column '{column}': {reason}")),
                ),
            }
        }
        FieldSource::RowOrdinal => (FieldValue::Int(ctx.ordinal()), None),
        FieldSource::OrdinalCode => (FieldValue::Text(ctx.ordinal_code()), None),
        FieldSource::SourceLabel => (FieldValue::Text(ctx.source_kind.label().to_string()), None),
        // Captions are filled in from the anchor map.
        FieldSource::AnchoredImages | FieldSource::Null => (FieldValue::Null, None),
        FieldSource::Default => (ctx.fallback(field, default), None),
    }
}

/// Field values of one row before assembly, field → value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowFields {
    values: BTreeMap<String, FieldValue>,
}

impl RowFields {
    fn text(&self, field: &str) -> Option<String> {
        self.values.get(field).cloned().and_then(FieldValue::into_text)
    }

    fn set_text(&mut self, field: &str, value: String) {
        self.values.insert(field.to_string(), FieldValue::Text(value));
    }
}

fn synthesize_row(
    ctx: &RowContext<'_>,
    rules: &RuleSet,
    degradations: &mut Vec<Degradation>,
) -> RowFields {
    let mut fields = RowFields::default();
    for field in ctx.schema.content_fields() {
        let (value, failure) = match rules.get(*field) {
            Some(rule) => synthesize_field(ctx, field, rule),
            None => (ctx.fallback(field, None), None),
        };
        if let Some(detail) = failure {
            let d = Degradation::new(
                DegradationKind::FieldSynthesisFailure,
                PipelineStage::Standardizing,
                detail,
            )
            .at_row(ctx.row);
            warn!("{}", d);
            degradations.push(d);
        }
        fields.values.insert(field.to_string(), value);
    }
    fields
}

// ── Translation ──────────────────────────────────────────────────────────

async fn translate_row(
    schema: SchemaTag,
    row: usize,
    fields: &mut RowFields,
    text: &dyn TextCapability,
) -> Result<usize, CapabilityError> {
    let offered: BTreeMap<String, String> = schema
        .translatable_fields()
        .iter()
        .filter_map(|f| {
            fields
                .text(f)
                .filter(|v| !v.trim().is_empty())
                .map(|v| (f.to_string(), v))
        })
        .collect();
    if offered.is_empty() {
        return Ok(0);
    }

    let request = TranslationRequest {
        schema,
        row,
        fields: offered,
    };
    let raw = text.translate(&request).await?;
    let answer: BTreeMap<String, serde_json::Value> = parse_json_answer(&raw)?;

    let mut replaced = 0;
    for (field, value) in answer {
        if !request.fields.contains_key(&field) {
            continue;
        }
        if let Some(s) = value.as_str().map(str::trim).filter(|s| !s.is_empty()) {
            fields.set_text(&field, s.to_string());
            replaced += 1;
        }
    }
    Ok(replaced)
}

// ── Assembly ─────────────────────────────────────────────────────────────

fn text_or_default(fields: &RowFields, ctx: &RowContext<'_>, field: &str) -> String {
    fields
        .text(field)
        .or_else(|| ctx.fallback(field, None).into_text())
        .unwrap_or_default()
}

fn resolve_numero(fields: &RowFields, ctx: &RowContext<'_>) -> Result<i64, String> {
    match fields.values.get("numero") {
        Some(FieldValue::Int(i)) => Ok(*i),
        Some(FieldValue::Text(s)) => {
            parse_integer(s).ok_or_else(|| format!("numero: '{s}' is not an integer"))
        }
        Some(FieldValue::Null) | None => Ok(ctx.ordinal()),
    }
}

fn assemble(
    ctx: &RowContext<'_>,
    fields: &RowFields,
    caption: Option<String>,
    degradations: &mut Vec<Degradation>,
) -> StandardizedRecord {
    match ctx.schema {
        SchemaTag::Rag1 => {
            let numero = resolve_numero(fields, ctx).unwrap_or_else(|detail| {
                let d = Degradation::new(
                    DegradationKind::FieldSynthesisFailure,
                    PipelineStage::Standardizing,
                    detail,
                )
                .at_row(ctx.row);
                warn!("{}", d);
                degradations.push(d);
                ctx.ordinal()
            });
            StandardizedRecord::Rag1(Rag1Record {
                id: new_record_id(),
                articulo_id: text_or_default(fields, ctx, "articulo_id"),
                tipo: text_or_default(fields, ctx, "tipo"),
                numero,
                titulo: text_or_default(fields, ctx, "titulo"),
                texto: text_or_default(fields, ctx, "texto"),
                image_caption: caption,
                keywords: fields.text("keywords").filter(|k| !k.is_empty()),
                embedding: None,
            })
        }
        SchemaTag::Rag2 => StandardizedRecord::Rag2(Rag2Record {
            id: new_record_id(),
            descripcion: text_or_default(fields, ctx, "descripcion"),
            tipo: text_or_default(fields, ctx, "tipo"),
            servicio: text_or_default(fields, ctx, "servicio"),
            categoria: text_or_default(fields, ctx, "categoria"),
            subcategoria: text_or_default(fields, ctx, "subcategoria"),
            fuente: text_or_default(fields, ctx, "fuente"),
            embedding: None,
        }),
    }
}

// ── Standardizer ─────────────────────────────────────────────────────────

/// Knobs for the standardization stage.
#[derive(Debug, Clone, Copy)]
pub struct StandardizerSettings {
    pub conceptualization_sample_rows: usize,
    pub translate: bool,
    pub describe_images: bool,
}

/// Everything the stage produced.
#[derive(Debug, Clone)]
pub struct StandardizeOutcome {
    /// One record per input row, in row order.
    pub records: Vec<StandardizedRecord>,
    pub rules: RuleSet,
    pub rule_origin: RuleOrigin,
    pub degradations: Vec<Degradation>,
}

/// Capability clients used by the stage.
#[derive(Clone, Copy)]
pub struct Capabilities<'a> {
    pub text: &'a dyn TextCapability,
    pub vision: &'a dyn VisionCapability,
}

/// Standardize every row of `table` into the routed schema.
pub async fn standardize(
    table: &RawTable,
    images: &ImageAnchorMap,
    source_kind: SourceKind,
    decision: &RoutingDecision,
    caps: Capabilities<'_>,
    settings: StandardizerSettings,
    progress: &dyn PipelineProgressCallback,
) -> StandardizeOutcome {
    let schema = decision.schema;
    let total = table.len();
    let (rules, rule_origin, rule_failure) =
        conceptualize(table, decision, caps.text, settings.conceptualization_sample_rows).await;

    if schema == SchemaTag::Rag1 && !settings.describe_images && !images.is_empty() {
        info!(
            "Image description disabled: {} anchored images left uncaptioned",
            images.image_count()
        );
    }

    let queue = CallQueue::single_worker();
    let rules_ref = &rules;
    let outcomes = queue
        .run(0..total, |row| async move {
            progress.on_row_start(row, total);
            let ctx = RowContext {
                schema,
                table,
                row,
                source_kind,
            };
            let mut degradations = Vec::new();
            let mut fields = synthesize_row(&ctx, rules_ref, &mut degradations);

            let caption = if schema == SchemaTag::Rag1 && settings.describe_images {
                let out = synthesize_caption(row, images.get(row), caps.vision, &queue).await;
                degradations.extend(out.degradations);
                out.caption
            } else {
                None
            };

            if settings.translate {
                match translate_row(schema, row, &mut fields, caps.text).await {
                    Ok(n) => debug!("Row {}: {} fields translated", row, n),
                    Err(e) => {
                        let d = Degradation::new(
                            DegradationKind::FieldSynthesisFailure,
                            PipelineStage::Standardizing,
                            format!("translation failed, keeping source text: {e}"),
                        )
                        .at_row(row);
                        warn!("{}", d);
                        degradations.push(d);
                    }
                }
            }

            let record = assemble(&ctx, &fields, caption, &mut degradations);
            progress.on_row_complete(row, total, !degradations.is_empty());
            (record, degradations)
        })
        .await;

    let mut degradations: Vec<Degradation> = rule_failure.into_iter().collect();
    let mut records = Vec::with_capacity(total);
    for (record, row_degradations) in outcomes {
        records.push(record);
        degradations.extend(row_degradations);
    }
    info!(
        "Standardized {} rows into {} ({} degradations)",
        records.len(),
        schema,
        degradations.len()
    );

    StandardizeOutcome {
        records,
        rules,
        rule_origin,
        degradations,
    }
}
