//! The two target record schemas.
//!
//! RAG1 records are structured documents (articles, procedures); RAG2 records
//! are service/ticket rows. [`StandardizedRecord`] is the tagged union over
//! both, matched exhaustively by the validator and by serialization. The JSON
//! field names are the contract with downstream consumers and must not change.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Target schema tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaTag {
    Rag1,
    Rag2,
}

impl SchemaTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaTag::Rag1 => "rag1",
            SchemaTag::Rag2 => "rag2",
        }
    }

    /// Fields that must be present (non-null) on every record.
    pub fn mandatory_fields(&self) -> &'static [&'static str] {
        match self {
            SchemaTag::Rag1 => &["id", "articulo_id", "tipo", "numero", "titulo", "texto"],
            SchemaTag::Rag2 => &[
                "id",
                "descripcion",
                "tipo",
                "servicio",
                "categoria",
                "subcategoria",
                "fuente",
            ],
        }
    }

    /// Fields filled from source columns or derivation rules, in output order.
    ///
    /// `id` and `embedding` are never sourced from the table.
    pub fn content_fields(&self) -> &'static [&'static str] {
        match self {
            SchemaTag::Rag1 => &[
                "articulo_id",
                "tipo",
                "numero",
                "titulo",
                "texto",
                "image_caption",
                "keywords",
            ],
            SchemaTag::Rag2 => &[
                "descripcion",
                "tipo",
                "servicio",
                "categoria",
                "subcategoria",
                "fuente",
            ],
        }
    }

    /// The long free-text field of the schema.
    pub fn descriptive_field(&self) -> &'static str {
        match self {
            SchemaTag::Rag1 => "texto",
            SchemaTag::Rag2 => "descripcion",
        }
    }

    /// Textual fields offered to the translation call.
    pub fn translatable_fields(&self) -> &'static [&'static str] {
        match self {
            SchemaTag::Rag1 => &["tipo", "titulo", "texto", "keywords"],
            SchemaTag::Rag2 => &["descripcion", "tipo", "servicio", "categoria", "subcategoria"],
        }
    }

    pub fn is_content_field(&self, field: &str) -> bool {
        self.content_fields().contains(&field)
    }
}

impl fmt::Display for SchemaTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchemaTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rag1" => Ok(SchemaTag::Rag1),
            "rag2" => Ok(SchemaTag::Rag2),
            other => Err(format!("unknown schema '{other}': expected rag1 or rag2")),
        }
    }
}

/// Structured document record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rag1Record {
    pub id: String,
    pub articulo_id: String,
    pub tipo: String,
    pub numero: i64,
    pub titulo: String,
    pub texto: String,
    pub image_caption: Option<String>,
    pub keywords: Option<String>,
    pub embedding: Option<Vec<f32>>,
}

/// Service/ticket record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rag2Record {
    pub id: String,
    pub descripcion: String,
    pub tipo: String,
    pub servicio: String,
    pub categoria: String,
    pub subcategoria: String,
    pub fuente: String,
    pub embedding: Option<Vec<f32>>,
}

/// One output record, in either schema.
///
/// Serialized without a tag: the surrounding result carries the schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StandardizedRecord {
    Rag1(Rag1Record),
    Rag2(Rag2Record),
}

impl StandardizedRecord {
    pub fn schema(&self) -> SchemaTag {
        match self {
            StandardizedRecord::Rag1(_) => SchemaTag::Rag1,
            StandardizedRecord::Rag2(_) => SchemaTag::Rag2,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            StandardizedRecord::Rag1(r) => &r.id,
            StandardizedRecord::Rag2(r) => &r.id,
        }
    }

    pub fn as_rag1(&self) -> Option<&Rag1Record> {
        match self {
            StandardizedRecord::Rag1(r) => Some(r),
            StandardizedRecord::Rag2(_) => None,
        }
    }

    pub fn as_rag2(&self) -> Option<&Rag2Record> {
        match self {
            StandardizedRecord::Rag2(r) => Some(r),
            StandardizedRecord::Rag1(_) => None,
        }
    }

    /// Text value of a string-typed field, `None` when absent or null.
    ///
    /// `numero` is rendered in decimal.
    pub fn text_field(&self, field: &str) -> Option<String> {
        match self {
            StandardizedRecord::Rag1(r) => match field {
                "id" => Some(r.id.clone()),
                "articulo_id" => Some(r.articulo_id.clone()),
                "tipo" => Some(r.tipo.clone()),
                "numero" => Some(r.numero.to_string()),
                "titulo" => Some(r.titulo.clone()),
                "texto" => Some(r.texto.clone()),
                "image_caption" => r.image_caption.clone(),
                "keywords" => r.keywords.clone(),
                _ => None,
            },
            StandardizedRecord::Rag2(r) => match field {
                "id" => Some(r.id.clone()),
                "descripcion" => Some(r.descripcion.clone()),
                "tipo" => Some(r.tipo.clone()),
                "servicio" => Some(r.servicio.clone()),
                "categoria" => Some(r.categoria.clone()),
                "subcategoria" => Some(r.subcategoria.clone()),
                "fuente" => Some(r.fuente.clone()),
                _ => None,
            },
        }
    }

    pub fn embedding(&self) -> Option<&[f32]> {
        match self {
            StandardizedRecord::Rag1(r) => r.embedding.as_deref(),
            StandardizedRecord::Rag2(r) => r.embedding.as_deref(),
        }
    }
}

/// Fresh record identifier.
pub fn new_record_id() -> String {
    Uuid::new_v4().to_string()
}

// ── Field defaults ───────────────────────────────────────────────────────

pub const DEFAULT_TIPO: &str = "General";
pub const DEFAULT_TITULO: &str = "Sin título";
pub const DEFAULT_SERVICIO: &str = "Sin especificar";
pub const DEFAULT_CATEGORIA: &str = "General";
pub const DEFAULT_SUBCATEGORIA: &str = "General";

/// Default value for a field when nothing usable was synthesized.
///
/// `fuente` depends on the source kind and is handled by the standardizer.
pub fn default_for(schema: SchemaTag, field: &str) -> Option<&'static str> {
    match (schema, field) {
        (_, "tipo") => Some(DEFAULT_TIPO),
        (SchemaTag::Rag1, "titulo") => Some(DEFAULT_TITULO),
        (SchemaTag::Rag1, "texto") => Some(""),
        (SchemaTag::Rag2, "descripcion") => Some(""),
        (SchemaTag::Rag2, "servicio") => Some(DEFAULT_SERVICIO),
        (SchemaTag::Rag2, "categoria") => Some(DEFAULT_CATEGORIA),
        (SchemaTag::Rag2, "subcategoria") => Some(DEFAULT_SUBCATEGORIA),
        _ => None,
    }
}
