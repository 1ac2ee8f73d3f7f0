//! Prompts for the edgequake-llm capability clients.
//!
//! Every prompt sent to a model lives here so wording can change without
//! touching retry or parsing logic. The answer shapes described in the
//! prompts are the ones [`crate::pipeline::route`] and
//! [`crate::pipeline::standardize`] parse.

use crate::capability::{AnalysisRequest, ConceptualizationRequest, TranslationRequest};
use crate::schema::SchemaTag;

/// System prompt for the routing call.
pub const ROUTING_SYSTEM_PROMPT: &str = r#"You are a data analyst preparing tabular data for a retrieval-augmented generation (RAG) index.

Two target schemas exist:

- rag1: structured documents such as laws, regulations, manuals and procedures.
  Fields: articulo_id, tipo, numero, titulo, texto, image_caption, keywords.
- rag2: services, tickets and requests.
  Fields: descripcion, tipo, servicio, categoria, subcategoria, fuente.

Given the column names and a sample of rows, decide which schema fits the data.

Respond ONLY with a JSON object, without markdown fences or commentary:
{
  "schema": "rag1" | "rag2",
  "rationale": "one or two sentences",
  "confidence": 0.0-1.0,
  "column_mapping": { "<target field>": "<source column>" }
}
Only map fields to columns that exist in the data."#;

/// System prompt for the transformation-rule call.
pub const CONCEPTUALIZATION_SYSTEM_PROMPT: &str = r#"You generate TRANSFORMATION RULES that convert tabular rows into a target RAG schema. Do NOT transform the rows yourself.

For every field of the target schema, specify:
- source_column: the column the value comes from (or null)
- transform: one of
    copy          copy the value as is, trimmed
    copy_full     copy long text completely, never summarise
    copy_or_null  copy when present, otherwise null
    to_integer    convert to an integer
    join_tags     split tags on ";" or "," and join them with ", "
- default: value used when the source is empty (or null)

Respond ONLY with a JSON object, without markdown fences or commentary:
{
  "rules": {
    "<field>": { "source_column": "...", "transform": "...", "default": ... }
  }
}"#;

/// System prompt for per-record translation.
pub const TRANSLATION_SYSTEM_PROMPT: &str = r#"You translate the textual fields of a record into clear, neutral Spanish.

Rules:
- Keep proper names, codes, numbers and identifiers unchanged.
- Never summarise: translate the complete text.
- If a field is already in Spanish, return it unchanged.

Respond ONLY with a JSON object holding the same keys as the input, without markdown fences or commentary."#;

/// System prompt for describing one image.
pub const IMAGE_DESCRIPTION_PROMPT: &str = r#"Describe this image in one or two sentences in Spanish, focusing on the action or step it shows. Output ONLY the description, without any prefix."#;

/// System prompt for describing several images in one call.
pub const MULTI_IMAGE_DESCRIPTION_PROMPT: &str = r#"You receive one or more images in order. Describe each image in one or two sentences in Spanish, focusing on the action or step it shows.

Respond ONLY with a JSON array of strings, one entry per image in the order received. Use null for an image you cannot describe."#;

/// User message for the routing call.
pub fn routing_user_prompt(request: &AnalysisRequest) -> String {
    format!(
        "The heuristic candidate is {}.\n\nDATA TO ANALYZE:\n{}",
        request.heuristic_schema,
        to_json(request)
    )
}

/// User message for the transformation-rule call.
pub fn conceptualization_user_prompt(request: &ConceptualizationRequest) -> String {
    format!(
        "TARGET SCHEMA: {}\nFIELDS: {}\n\nCONTEXT:\n{}",
        request.schema,
        request.schema.content_fields().join(", "),
        to_json(request)
    )
}

/// User message for the translation call.
pub fn translation_user_prompt(request: &TranslationRequest) -> String {
    to_json(&request.fields)
}

/// Schema description used in log lines.
pub fn schema_summary(schema: SchemaTag) -> &'static str {
    match schema {
        SchemaTag::Rag1 => "structured documents",
        SchemaTag::Rag2 => "services and tickets",
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}
