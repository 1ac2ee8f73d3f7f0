//! Source ingestion: raw bytes → [`RawTable`] (+ [`ImageAnchorMap`]).
//!
//! The core never touches the file system. A caller hands over a
//! [`SourceFile`] (bytes, filename and declared kind) and gets back a
//! row-oriented table whose zero-based row indices are the same keys the
//! image anchor map uses.
//!
//! Values are passed through as read: no type inference, no cleaning. Only
//! column names are normalized. Parsing is CPU-bound and runs inside
//! `spawn_blocking`.

use crate::error::{Degradation, DegradationKind, IngestionError, StandardizeError};
use crate::pipeline::images::{extract_image_anchors, ImageAnchorMap, SheetLayout};
use crate::pipeline::PipelineStage;
use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

// ── Source ───────────────────────────────────────────────────────────────

/// Declared kind of a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// CSV, TSV or other delimited text.
    DelimitedText,
    /// XLSX workbook.
    Spreadsheet,
}

impl SourceKind {
    /// Infer the kind from a file extension.
    pub fn from_filename(filename: &str) -> Result<Self, IngestionError> {
        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "csv" | "tsv" | "txt" => Ok(SourceKind::DelimitedText),
            "xlsx" | "xlsm" => Ok(SourceKind::Spreadsheet),
            _ => Err(IngestionError::UnsupportedSource {
                filename: filename.to_string(),
            }),
        }
    }

    /// Short label, also the RAG2 `fuente` default.
    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::DelimitedText => "csv",
            SourceKind::Spreadsheet => "xlsx",
        }
    }
}

/// Raw bytes of a source plus what the caller says they are.
#[derive(Clone)]
pub struct SourceFile {
    pub bytes: Arc<[u8]>,
    pub filename: String,
    pub kind: SourceKind,
}

impl fmt::Debug for SourceFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceFile")
            .field("bytes", &format_args!("<{} bytes>", self.bytes.len()))
            .field("filename", &self.filename)
            .field("kind", &self.kind)
            .finish()
    }
}

impl SourceFile {
    /// Build a source, inferring the kind from the filename.
    pub fn new(bytes: impl Into<Vec<u8>>, filename: impl Into<String>) -> Result<Self, IngestionError> {
        let filename = filename.into();
        let kind = SourceKind::from_filename(&filename)?;
        Ok(Self::with_kind(bytes, filename, kind))
    }

    /// Build a source with an explicitly declared kind.
    pub fn with_kind(
        bytes: impl Into<Vec<u8>>,
        filename: impl Into<String>,
        kind: SourceKind,
    ) -> Self {
        Self {
            bytes: Arc::from(bytes.into()),
            filename: filename.into(),
            kind,
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

// ── Table ────────────────────────────────────────────────────────────────

/// One cell as read from the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Empty,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl RawValue {
    pub fn is_empty(&self) -> bool {
        match self {
            RawValue::Empty => true,
            RawValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Empty => Ok(()),
            RawValue::Text(s) => f.write_str(s),
            RawValue::Int(i) => write!(f, "{i}"),
            RawValue::Float(x) => write!(f, "{x}"),
            RawValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// One data row; `values[i]` belongs to `RawTable::columns[i]`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawRow {
    pub values: Vec<RawValue>,
}

impl RawRow {
    pub fn get(&self, col: usize) -> &RawValue {
        self.values.get(col).unwrap_or(&RawValue::Empty)
    }

    pub fn is_blank(&self) -> bool {
        self.values.iter().all(RawValue::is_empty)
    }
}

/// Encoding the source was decoded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectedEncoding {
    Utf8,
    Utf8Bom,
    Utf16Le,
    Utf16Be,
    Windows1252,
    /// Spreadsheet packages carry their own (UTF-8 XML) encoding.
    Workbook,
}

/// Immutable row-oriented table.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTable {
    /// Normalized, unique column names.
    pub columns: Vec<String>,
    pub rows: Vec<RawRow>,
    pub encoding: DetectedEncoding,
}

impl RawTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&RawValue> {
        let col = self.column_index(column)?;
        self.rows.get(row).map(|r| r.get(col))
    }

    /// Row as column name → display value.
    pub fn row_map(&self, row: usize) -> BTreeMap<String, String> {
        let Some(r) = self.rows.get(row) else {
            return BTreeMap::new();
        };
        self.columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), r.get(i).to_string()))
            .collect()
    }

    /// The first `n` rows as maps, in row order.
    pub fn sample(&self, n: usize) -> Vec<BTreeMap<String, String>> {
        (0..self.rows.len().min(n)).map(|i| self.row_map(i)).collect()
    }
}

/// Output of the ingestion stage.
#[derive(Debug, Clone)]
pub struct IngestedTable {
    pub table: RawTable,
    pub images: ImageAnchorMap,
    pub warnings: Vec<Degradation>,
    /// Zero-based sheet row of the header (spreadsheets only).
    pub header_row: Option<u32>,
}

// ── Entry point ──────────────────────────────────────────────────────────

/// Decode a source into a table (and, for spreadsheets, its image anchors).
///
/// # Errors
/// Any [`IngestionError`]; a panic in the parsing task is `Internal`.
pub async fn ingest(
    source: &SourceFile,
    max_file_bytes: usize,
    max_image_dimension: u32,
) -> Result<IngestedTable, StandardizeError> {
    if source.size() > max_file_bytes {
        return Err(IngestionError::FileTooLarge {
            size: source.size(),
            limit: max_file_bytes,
        }
        .into());
    }

    let bytes = Arc::clone(&source.bytes);
    let kind = source.kind;
    let filename = source.filename.clone();
    info!("Ingesting {} ({} bytes, {})", filename, bytes.len(), kind.label());

    let ingested = tokio::task::spawn_blocking(move || match kind {
        SourceKind::DelimitedText => ingest_delimited(&bytes),
        SourceKind::Spreadsheet => {
            ingest_spreadsheet(&bytes, max_image_dimension, max_file_bytes)
        }
    })
    .await
    .map_err(|e| StandardizeError::Internal(format!("Ingestion task panicked: {}", e)))??;

    info!(
        "Ingested {}: {} columns, {} rows, {} images",
        filename,
        ingested.table.columns.len(),
        ingested.table.len(),
        ingested.images.image_count()
    );
    Ok(ingested)
}

// ── Delimited text ───────────────────────────────────────────────────────

fn ingest_delimited(bytes: &[u8]) -> Result<IngestedTable, IngestionError> {
    let (text, encoding) = decode_text(bytes)?;
    let table = parse_delimited(&text, encoding)?;
    Ok(IngestedTable {
        table,
        images: ImageAnchorMap::new(),
        warnings: Vec::new(),
        header_row: None,
    })
}

/// Detect the encoding of delimited text and decode it.
///
/// BOMs win; otherwise strict UTF-8, otherwise Windows-1252. Text holding NUL
/// or other C0 controls (besides tab, newlines and form feed) is binary.
pub fn decode_text(bytes: &[u8]) -> Result<(String, DetectedEncoding), IngestionError> {
    let (text, encoding) = if let Some(rest) = bytes.strip_prefix(b"\xEF\xBB\xBF") {
        let s = std::str::from_utf8(rest).map_err(|e| IngestionError::UndecodableText {
            detail: format!("UTF-8 BOM but invalid UTF-8: {e}"),
        })?;
        (s.to_string(), DetectedEncoding::Utf8Bom)
    } else if let Some(rest) = bytes.strip_prefix(b"\xFF\xFE") {
        (decode_utf16(rest, u16::from_le_bytes)?, DetectedEncoding::Utf16Le)
    } else if let Some(rest) = bytes.strip_prefix(b"\xFE\xFF") {
        (decode_utf16(rest, u16::from_be_bytes)?, DetectedEncoding::Utf16Be)
    } else {
        match std::str::from_utf8(bytes) {
            Ok(s) => (s.to_string(), DetectedEncoding::Utf8),
            Err(_) => {
                debug!("Input is not UTF-8, falling back to Windows-1252");
                (decode_windows_1252(bytes), DetectedEncoding::Windows1252)
            }
        }
    };

    if let Some((pos, c)) = text
        .char_indices()
        .find(|(_, c)| (*c as u32) < 0x20 && !matches!(*c, '\t' | '\n' | '\r' | '\x0C'))
    {
        return Err(IngestionError::UndecodableText {
            detail: format!(
                "binary content: control character U+{:04X} at offset {}",
                c as u32, pos
            ),
        });
    }

    Ok((text, encoding))
}

/// Code points for bytes 0x80..=0x9F. Unassigned bytes keep their C1 value.
const WINDOWS_1252_HIGH: [char; 32] = [
    '\u{20AC}', '\u{0081}', '\u{201A}', '\u{0192}', '\u{201E}', '\u{2026}', '\u{2020}', '\u{2021}',
    '\u{02C6}', '\u{2030}', '\u{0160}', '\u{2039}', '\u{0152}', '\u{008D}', '\u{017D}', '\u{008F}',
    '\u{0090}', '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}', '\u{2022}', '\u{2013}', '\u{2014}',
    '\u{02DC}', '\u{2122}', '\u{0161}', '\u{203A}', '\u{0153}', '\u{009D}', '\u{017E}', '\u{0178}',
];

fn decode_windows_1252(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| match b {
            0x80..=0x9F => WINDOWS_1252_HIGH[usize::from(b - 0x80)],
            _ => char::from(b),
        })
        .collect()
}

fn decode_utf16(bytes: &[u8], from_bytes: fn([u8; 2]) -> u16) -> Result<String, IngestionError> {
    if bytes.len() % 2 != 0 {
        return Err(IngestionError::UndecodableText {
            detail: "UTF-16 BOM but odd byte length".into(),
        });
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| from_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).map_err(|e| IngestionError::UndecodableText {
        detail: format!("invalid UTF-16: {e}"),
    })
}

const DELIMITERS: [u8; 4] = [b',', b';', b'\t', b'|'];

/// Pick the delimiter occurring most often on the header line, outside quotes.
///
/// Ties resolve to `,`.
pub fn sniff_delimiter(text: &str) -> u8 {
    let header = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let mut counts: HashMap<u8, usize> = HashMap::new();
    let mut in_quotes = false;
    for b in header.bytes() {
        if b == b'"' {
            in_quotes = !in_quotes;
        } else if !in_quotes && DELIMITERS.contains(&b) {
            *counts.entry(b).or_default() += 1;
        }
    }

    let mut best = b',';
    let mut best_count = counts.get(&b',').copied().unwrap_or(0);
    for d in DELIMITERS {
        let n = counts.get(&d).copied().unwrap_or(0);
        if n > best_count {
            best = d;
            best_count = n;
        }
    }
    best
}

fn parse_delimited(text: &str, encoding: DetectedEncoding) -> Result<RawTable, IngestionError> {
    if text.trim().is_empty() {
        return Err(IngestionError::NoColumns);
    }
    let delimiter = sniff_delimiter(text);
    debug!("Delimiter sniffed: {:?}", char::from(delimiter));

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let header: Vec<String> = reader
        .headers()
        .map_err(|e| IngestionError::MalformedDelimited {
            record: 0,
            detail: e.to_string(),
        })?
        .iter()
        .map(str::to_string)
        .collect();
    if header.iter().all(|h| h.trim().is_empty()) {
        return Err(IngestionError::NoColumns);
    }
    let columns = normalize_column_names(&header);

    let mut rows = Vec::new();
    for (i, result) in reader.records().enumerate() {
        let record = result.map_err(|e| IngestionError::MalformedDelimited {
            record: i + 1,
            detail: e.to_string(),
        })?;
        if record.len() > columns.len() {
            return Err(IngestionError::MalformedDelimited {
                record: i + 1,
                detail: format!("expected {} fields, found {}", columns.len(), record.len()),
            });
        }
        let mut values: Vec<RawValue> = record
            .iter()
            .map(|field| {
                if field.trim().is_empty() {
                    RawValue::Empty
                } else {
                    RawValue::Text(field.to_string())
                }
            })
            .collect();
        values.resize(columns.len(), RawValue::Empty);
        let row = RawRow { values };
        if row.is_blank() {
            continue;
        }
        rows.push(row);
    }

    if rows.is_empty() {
        return Err(IngestionError::NoRows);
    }
    Ok(RawTable {
        columns,
        rows,
        encoding,
    })
}

// ── Spreadsheet ──────────────────────────────────────────────────────────

fn ingest_spreadsheet(
    bytes: &[u8],
    max_image_dimension: u32,
    max_part_bytes: usize,
) -> Result<IngestedTable, IngestionError> {
    let (table, header_row) = parse_spreadsheet(bytes)?;

    let layout = SheetLayout {
        header_row,
        data_rows: table.len(),
    };
    let extraction = extract_image_anchors(bytes, layout, max_image_dimension, max_part_bytes);
    let (images, warnings) = match extraction {
        Ok(extraction) => (extraction.anchors, extraction.warnings),
        Err(e) => {
            let w = Degradation::new(
                DegradationKind::ImageExtractionWarning,
                PipelineStage::Ingesting,
                format!("image extraction skipped: {e}"),
            );
            warn!("{}", w);
            (ImageAnchorMap::new(), vec![w])
        }
    };

    Ok(IngestedTable {
        table,
        images,
        warnings,
        header_row: Some(header_row),
    })
}

/// Read the first worksheet. The first row of its used range is the header.
///
/// Blank rows inside the range are kept so row indices match sheet rows.
fn parse_spreadsheet(bytes: &[u8]) -> Result<(RawTable, u32), IngestionError> {
    let mut workbook: Xlsx<_> = open_workbook_from_rs(Cursor::new(bytes)).map_err(|e| {
        IngestionError::CorruptSpreadsheet {
            detail: format!("{e}"),
        }
    })?;

    let range = workbook
        .worksheet_range_at(0)
        .ok_or(IngestionError::NoWorksheet)?
        .map_err(|e| IngestionError::CorruptSpreadsheet {
            detail: format!("{e}"),
        })?;

    let Some((header_row, _)) = range.start() else {
        return Err(IngestionError::NoColumns);
    };

    let mut sheet_rows = range.rows();
    let header: Vec<String> = sheet_rows
        .next()
        .ok_or(IngestionError::NoColumns)?
        .iter()
        .map(|cell| cell_value(cell).to_string())
        .collect();
    if header.iter().all(|h| h.trim().is_empty()) {
        return Err(IngestionError::NoColumns);
    }
    let columns = normalize_column_names(&header);

    let rows: Vec<RawRow> = sheet_rows
        .map(|cells| {
            let mut values: Vec<RawValue> = cells.iter().map(cell_value).collect();
            values.resize(columns.len(), RawValue::Empty);
            RawRow { values }
        })
        .collect();

    if rows.iter().all(RawRow::is_blank) {
        return Err(IngestionError::NoRows);
    }

    debug!(
        "Worksheet: header on sheet row {}, {} data rows",
        header_row + 1,
        rows.len()
    );
    Ok((
        RawTable {
            columns,
            rows,
            encoding: DetectedEncoding::Workbook,
        },
        header_row,
    ))
}

fn cell_value(cell: &Data) -> RawValue {
    match cell {
        Data::Empty => RawValue::Empty,
        Data::String(s) if s.trim().is_empty() => RawValue::Empty,
        Data::String(s) => RawValue::Text(s.clone()),
        Data::Int(i) => RawValue::Int(*i),
        Data::Float(f) => RawValue::Float(*f),
        Data::Bool(b) => RawValue::Bool(*b),
        Data::DateTime(dt) => RawValue::Text(dt.to_string()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => RawValue::Text(s.clone()),
        _ => RawValue::Empty,
    }
}

// ── Column names ─────────────────────────────────────────────────────────

static RE_SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\s\-]+").unwrap());

/// Trim, lowercase and snake-case one column name.
pub fn normalize_column_name(name: &str) -> String {
    RE_SEPARATORS
        .replace_all(name.trim(), "_")
        .trim_matches('_')
        .to_lowercase()
}

/// Normalize every column name; fill blanks and dedupe.
pub fn normalize_column_names(raw: &[String]) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(raw.len());

    for (i, name) in raw.iter().enumerate() {
        let base = normalize_column_name(name);
        let base = if base.is_empty() {
            format!("column_{}", i + 1)
        } else {
            base
        };

        let mut candidate = base.clone();
        let mut n = 1;
        while seen.contains(&candidate) {
            n += 1;
            candidate = format!("{base}_{n}");
        }
        seen.insert(candidate.clone());
        out.push(candidate);
    }
    out
}
