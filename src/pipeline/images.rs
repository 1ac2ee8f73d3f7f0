//! Embedded-image extraction: spreadsheet drawings → row-anchored assets.
//!
//! An XLSX file is a zip package. Pictures live in a drawing part attached to
//! the worksheet, and each picture carries a cell anchor saying where it sits
//! on the grid. The walk is:
//!
//! ```text
//! workbook.xml ─▶ workbook rels ─▶ first sheet ─▶ sheet rels ─▶ drawing
//!                                                                  │
//!        ImageAnchorMap ◀── normalize ◀── media bytes ◀── drawing rels
//! ```
//!
//! Every failure past the package itself is per image: the picture is dropped
//! and reported as an `ImageExtractionWarning`, never guessed into a row.
//! This module is CPU-bound and is called from the ingestor's blocking task.

use crate::capability::encode::encode_png;
use crate::config::MAX_IMAGE_DIMENSION;
use crate::error::{Degradation, DegradationKind, IngestionError};
use crate::pipeline::PipelineStage;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, RgbImage};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::{Cursor, Read};
use tracing::{debug, info, warn};
use zip::ZipArchive;

/// Codec of the payload as stored in the spreadsheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceImageFormat {
    Png,
    Jpeg,
    Gif,
    Bmp,
}

impl SourceImageFormat {
    fn from_image_format(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Png => Some(Self::Png),
            ImageFormat::Jpeg => Some(Self::Jpeg),
            ImageFormat::Gif => Some(Self::Gif),
            ImageFormat::Bmp => Some(Self::Bmp),
            _ => None,
        }
    }
}

/// Zero-based sheet cell of a picture's top-left corner, with EMU offsets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorPosition {
    pub row: u32,
    pub col: u32,
    pub row_offset: i64,
    pub col_offset: i64,
}

/// One normalized embedded image.
#[derive(Clone, PartialEq)]
pub struct ImageAsset {
    /// RGB PNG, longest edge within the configured maximum.
    pub payload: Vec<u8>,
    pub source_format: SourceImageFormat,
    pub width: u32,
    pub height: u32,
    pub anchor: AnchorPosition,
    /// Package path of the original media part, e.g. `xl/media/image1.png`.
    pub media_path: String,
}

impl fmt::Debug for ImageAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageAsset")
            .field("payload", &format_args!("<{} bytes>", self.payload.len()))
            .field("source_format", &self.source_format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("anchor", &self.anchor)
            .field("media_path", &self.media_path)
            .finish()
    }
}

/// Data-row index → images anchored on that row, in anchor order.
///
/// Each asset appears under exactly one row. Rows without images have no
/// entry; [`ImageAnchorMap::get`] returns an empty slice for them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageAnchorMap {
    rows: BTreeMap<usize, Vec<ImageAsset>>,
}

impl ImageAnchorMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, row: usize) -> &[ImageAsset] {
        self.rows.get(&row).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn image_count(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows holding at least one image, ascending.
    pub fn rows(&self) -> impl Iterator<Item = usize> + '_ {
        self.rows.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &[ImageAsset])> + '_ {
        self.rows.iter().map(|(r, v)| (*r, v.as_slice()))
    }

    fn from_rows(rows: BTreeMap<usize, Vec<ImageAsset>>) -> Self {
        Self { rows }
    }
}

/// Where the data rows sit on the worksheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SheetLayout {
    /// Zero-based sheet row of the header.
    pub header_row: u32,
    pub data_rows: usize,
}

impl SheetLayout {
    /// Data row for a zero-based sheet row, if the row holds data.
    pub fn data_row_for(&self, sheet_row: u32) -> Option<usize> {
        let row = i64::from(sheet_row) - i64::from(self.header_row) - 1;
        if row < 0 || row as usize >= self.data_rows {
            None
        } else {
            Some(row as usize)
        }
    }
}

/// Anchor map plus the per-image warnings raised while building it.
#[derive(Debug, Default)]
pub struct ImageExtraction {
    pub anchors: ImageAnchorMap,
    pub warnings: Vec<Degradation>,
}

/// Extract and normalize every picture on the first worksheet.
///
/// `max_dimension` is capped at [`MAX_IMAGE_DIMENSION`]. No package part may
/// inflate past `max_part_bytes`.
///
/// # Errors
/// Only when the bytes are not a zip package. Missing parts mean "no
/// images"; bad pictures become warnings.
pub fn extract_image_anchors(
    bytes: &[u8],
    layout: SheetLayout,
    max_dimension: u32,
    max_part_bytes: usize,
) -> Result<ImageExtraction, IngestionError> {
    let limit = max_part_bytes as u64;
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|e| IngestionError::CorruptSpreadsheet {
            detail: e.to_string(),
        })?;

    let Some(drawing_path) = locate_drawing(&mut archive, limit) else {
        debug!("First worksheet has no drawing part");
        return Ok(ImageExtraction::default());
    };

    let Some(drawing_xml) = read_part_string(&mut archive, &drawing_path, limit) else {
        return Ok(ImageExtraction {
            anchors: ImageAnchorMap::new(),
            warnings: vec![extraction_warning(format!(
                "drawing part {drawing_path} is missing or unreadable"
            ))],
        });
    };

    let drawing_dir = parent_dir(&drawing_path);
    let drawing_rels: HashMap<String, String> =
        read_part_string(&mut archive, &rels_path_for(&drawing_path), limit)
            .map(|xml| {
                parse_relationships(&xml)
                    .into_iter()
                    .filter(|r| !r.external)
                    .map(|r| (r.id, resolve_target(drawing_dir, &r.target)))
                    .collect()
            })
            .unwrap_or_default();

    let anchors = parse_drawing(&drawing_xml);
    let pictures = anchors.iter().filter(|a| a.is_picture).count();
    info!("Drawing {} holds {} pictures", drawing_path, pictures);

    let mut warnings = Vec::new();
    let mut placed: Vec<(usize, usize, ImageAsset)> = Vec::new();

    for (order, anchor) in anchors.into_iter().filter(|a| a.is_picture).enumerate() {
        let image_no = order + 1;
        match place_picture(&mut archive, &anchor, &drawing_rels, layout, max_dimension, limit) {
            Ok((row, asset)) => {
                debug!(
                    "Image {} ({}) → row {} ({}x{})",
                    image_no, asset.media_path, row, asset.width, asset.height
                );
                placed.push((row, order, asset));
            }
            Err((row, detail)) => {
                let mut w = extraction_warning(detail).at_image(image_no);
                if let Some(row) = row {
                    w = w.at_row(row);
                }
                warn!("{}", w);
                warnings.push(w);
            }
        }
    }

    // Same-row order: top-to-bottom, then left-to-right, then document order.
    placed.sort_by_key(|(row, order, a)| {
        (*row, a.anchor.row_offset, a.anchor.col, a.anchor.col_offset, *order)
    });
    let mut rows: BTreeMap<usize, Vec<ImageAsset>> = BTreeMap::new();
    for (row, _, asset) in placed {
        rows.entry(row).or_default().push(asset);
    }

    let anchors = ImageAnchorMap::from_rows(rows);
    info!(
        "Anchored {} images on {} rows ({} dropped)",
        anchors.image_count(),
        anchors.rows.len(),
        warnings.len()
    );
    Ok(ImageExtraction { anchors, warnings })
}

fn extraction_warning(detail: impl Into<String>) -> Degradation {
    Degradation::new(
        DegradationKind::ImageExtractionWarning,
        PipelineStage::Ingesting,
        detail,
    )
}

/// Resolve, read, decode and normalize one picture.
///
/// The error carries the data row when it was already known.
fn place_picture<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    anchor: &DrawingAnchor,
    rels: &HashMap<String, String>,
    layout: SheetLayout,
    max_dimension: u32,
    limit: u64,
) -> Result<(usize, ImageAsset), (Option<usize>, String)> {
    let position = match (anchor.kind, anchor.from) {
        (AnchorKind::Absolute, _) => {
            return Err((None, "absolute anchor has no cell position".into()))
        }
        (_, None) => return Err((None, "anchor has no 'from' cell marker".into())),
        (_, Some(p)) => p,
    };

    let Some(row) = layout.data_row_for(position.row) else {
        return Err((
            None,
            format!(
                "anchored on sheet row {} which holds no data (header row {}, {} data rows)",
                position.row + 1,
                layout.header_row + 1,
                layout.data_rows
            ),
        ));
    };

    let embed = anchor
        .embed
        .as_deref()
        .ok_or_else(|| (Some(row), "picture has no image reference".to_string()))?;
    let media_path = rels
        .get(embed)
        .ok_or_else(|| (Some(row), format!("relationship {embed} not found")))?;
    let bytes = read_part(archive, media_path, limit).map_err(|e| (Some(row), e))?;

    let (source_format, normalized) =
        normalize_image(&bytes, max_dimension).map_err(|e| (Some(row), e))?;
    let payload = encode_png(&normalized)
        .map_err(|e| (Some(row), format!("PNG re-encoding failed: {e}")))?;

    Ok((
        row,
        ImageAsset {
            payload,
            source_format,
            width: normalized.width(),
            height: normalized.height(),
            anchor: position,
            media_path: media_path.clone(),
        },
    ))
}

// ── Normalization ────────────────────────────────────────────────────────

/// Decode a payload, composite alpha over white and fit it within
/// `max_dimension` (at most [`MAX_IMAGE_DIMENSION`]) on the longest edge.
/// Never upscales.
pub fn normalize_image(
    bytes: &[u8],
    max_dimension: u32,
) -> Result<(SourceImageFormat, DynamicImage), String> {
    let max_dimension = max_dimension.clamp(1, MAX_IMAGE_DIMENSION);
    let format = image::guess_format(bytes).map_err(|_| "unrecognized image codec".to_string())?;
    let source_format = SourceImageFormat::from_image_format(format)
        .ok_or_else(|| format!("unsupported image codec {format:?}"))?;
    let decoded = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| format!("corrupt {format:?} payload: {e}"))?;

    let rgb = flatten_over_white(&decoded);
    let (w, h) = rgb.dimensions();
    let longest = w.max(h);
    let rgb = if longest > max_dimension {
        let scale = f64::from(max_dimension) / f64::from(longest);
        let nw = ((f64::from(w) * scale).round() as u32).clamp(1, max_dimension);
        let nh = ((f64::from(h) * scale).round() as u32).clamp(1, max_dimension);
        image::imageops::resize(&rgb, nw, nh, FilterType::Lanczos3)
    } else {
        rgb
    };

    Ok((source_format, DynamicImage::ImageRgb8(rgb)))
}

fn flatten_over_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    let (w, h) = rgba.dimensions();
    let mut out = RgbImage::new(w, h);
    for (x, y, p) in rgba.enumerate_pixels() {
        let a = u32::from(p[3]);
        let blend = |c: u8| ((u32::from(c) * a + 255 * (255 - a) + 127) / 255) as u8;
        out.put_pixel(x, y, image::Rgb([blend(p[0]), blend(p[1]), blend(p[2])]));
    }
    out
}

// ── Package walk ─────────────────────────────────────────────────────────

const DRAWING_REL_SUFFIX: &str = "/drawing";

/// Path of the drawing part attached to the first worksheet.
fn locate_drawing<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    limit: u64,
) -> Option<String> {
    let workbook = read_part_string(archive, "xl/workbook.xml", limit)?;
    let sheet_rid = first_sheet_rid(&workbook)?;

    let workbook_rels = read_part_string(archive, "xl/_rels/workbook.xml.rels", limit)?;
    let sheet_path = parse_relationships(&workbook_rels)
        .into_iter()
        .find(|r| r.id == sheet_rid)
        .map(|r| resolve_target("xl", &r.target))?;

    let sheet_rels = read_part_string(archive, &rels_path_for(&sheet_path), limit)?;
    parse_relationships(&sheet_rels)
        .into_iter()
        .find(|r| !r.external && r.rel_type.ends_with(DRAWING_REL_SUFFIX))
        .map(|r| resolve_target(parent_dir(&sheet_path), &r.target))
}

/// Inflate one part, reading at most `limit` bytes.
fn read_part<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
    limit: u64,
) -> Result<Vec<u8>, String> {
    let file = archive
        .by_name(name)
        .map_err(|_| format!("part {name} is missing"))?;
    let mut buf = Vec::new();
    file.take(limit.saturating_add(1))
        .read_to_end(&mut buf)
        .map_err(|e| format!("part {name} is unreadable: {e}"))?;
    if buf.len() as u64 > limit {
        return Err(format!("part {name} inflates past {limit} bytes"));
    }
    Ok(buf)
}

fn read_part_string<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
    limit: u64,
) -> Option<String> {
    read_part(archive, name, limit)
        .map_err(|e| debug!("{}", e))
        .ok()
        .and_then(|b| String::from_utf8(b).ok())
}

/// `xl/worksheets/sheet1.xml` → `xl/worksheets/_rels/sheet1.xml.rels`.
pub fn rels_path_for(part: &str) -> String {
    match part.rsplit_once('/') {
        Some((dir, file)) => format!("{dir}/_rels/{file}.rels"),
        None => format!("_rels/{part}.rels"),
    }
}

fn parent_dir(part: &str) -> &str {
    part.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Resolve a relationship target against the directory of its source part.
///
/// Absolute targets (`/xl/media/x.png`) are package-rooted.
pub fn resolve_target(base_dir: &str, target: &str) -> String {
    let mut segments: Vec<&str> = if target.starts_with('/') {
        Vec::new()
    } else {
        base_dir.split('/').filter(|s| !s.is_empty()).collect()
    };
    for seg in target.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    segments.join("/")
}

// ── XML parts ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
struct Relationship {
    id: String,
    rel_type: String,
    target: String,
    external: bool,
}

fn attr_value(e: &BytesStart<'_>, local: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == local)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn parse_relationships(xml: &str) -> Vec<Relationship> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut rels = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e))
                if e.local_name().as_ref() == b"Relationship" =>
            {
                if let (Some(id), Some(target)) = (attr_value(&e, b"Id"), attr_value(&e, b"Target"))
                {
                    rels.push(Relationship {
                        id,
                        rel_type: attr_value(&e, b"Type").unwrap_or_default(),
                        target,
                        external: attr_value(&e, b"TargetMode")
                            .is_some_and(|m| m.eq_ignore_ascii_case("External")),
                    });
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!("Relationships part is malformed: {}", e);
                break;
            }
            _ => {}
        }
    }
    rels
}

/// Relationship id of the first `<sheet>` in workbook order.
fn first_sheet_rid(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"sheet" => {
                return attr_value(&e, b"id");
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AnchorKind {
    TwoCell,
    OneCell,
    Absolute,
}

#[derive(Debug, Clone, PartialEq)]
struct DrawingAnchor {
    kind: AnchorKind,
    from: Option<AnchorPosition>,
    embed: Option<String>,
    is_picture: bool,
}

#[derive(Debug, Clone, Copy)]
enum MarkerField {
    Row,
    Col,
    RowOff,
    ColOff,
}

fn anchor_kind(local: &[u8]) -> Option<AnchorKind> {
    match local {
        b"twoCellAnchor" => Some(AnchorKind::TwoCell),
        b"oneCellAnchor" => Some(AnchorKind::OneCell),
        b"absoluteAnchor" => Some(AnchorKind::Absolute),
        _ => None,
    }
}

/// Every anchor of a drawing part, in document order.
fn parse_drawing(xml: &str) -> Vec<DrawingAnchor> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut anchors = Vec::new();
    let mut current: Option<DrawingAnchor> = None;
    let mut in_from = false;
    let mut marker = AnchorPosition::default();
    let mut field: Option<MarkerField> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let local = e.local_name();
                let local = local.as_ref();
                if let Some(kind) = anchor_kind(local) {
                    current = Some(DrawingAnchor {
                        kind,
                        from: None,
                        embed: None,
                        is_picture: false,
                    });
                    continue;
                }
                let Some(anchor) = current.as_mut() else {
                    continue;
                };
                match local {
                    b"from" => {
                        in_from = true;
                        marker = AnchorPosition::default();
                    }
                    b"row" if in_from => field = Some(MarkerField::Row),
                    b"col" if in_from => field = Some(MarkerField::Col),
                    b"rowOff" if in_from => field = Some(MarkerField::RowOff),
                    b"colOff" if in_from => field = Some(MarkerField::ColOff),
                    b"pic" => anchor.is_picture = true,
                    b"blip" if anchor.is_picture => anchor.embed = attr_value(&e, b"embed"),
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                let local = e.local_name();
                let local = local.as_ref();
                if let Some(kind) = anchor_kind(local) {
                    anchors.push(DrawingAnchor {
                        kind,
                        from: None,
                        embed: None,
                        is_picture: false,
                    });
                } else if let Some(anchor) = current.as_mut() {
                    if local == b"blip" && anchor.is_picture {
                        anchor.embed = attr_value(&e, b"embed");
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if let Some(f) = field {
                    let text = t.unescape().map(|s| s.into_owned()).unwrap_or_default();
                    let value: i64 = text.trim().parse().unwrap_or(-1);
                    match f {
                        MarkerField::Row => marker.row = u32::try_from(value).unwrap_or(u32::MAX),
                        MarkerField::Col => marker.col = u32::try_from(value).unwrap_or(0),
                        MarkerField::RowOff => marker.row_offset = value.max(0),
                        MarkerField::ColOff => marker.col_offset = value.max(0),
                    }
                }
            }
            Ok(Event::End(e)) => {
                let local = e.local_name();
                let local = local.as_ref();
                if anchor_kind(local).is_some() {
                    if let Some(anchor) = current.take() {
                        anchors.push(anchor);
                    }
                    in_from = false;
                    field = None;
                    continue;
                }
                match local {
                    b"from" if in_from => {
                        in_from = false;
                        if let Some(anchor) = current.as_mut() {
                            if marker.row != u32::MAX {
                                anchor.from = Some(marker);
                            }
                        }
                    }
                    b"row" | b"col" | b"rowOff" | b"colOff" => field = None,
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!("Drawing part is malformed: {}", e);
                break;
            }
            _ => {}
        }
    }
    anchors
}
