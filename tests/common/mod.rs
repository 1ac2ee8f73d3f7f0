//! Shared fixtures for the integration tests: an in-memory XLSX writer and
//! deterministic capability stubs.
//!
//! Nothing here touches the network. Workbooks are assembled part by part
//! with `zip`, so a test controls exactly which pictures are anchored where.

#![allow(dead_code)]

use async_trait::async_trait;
use edgequake_tab2rag::capability::{
    AnalysisRequest, ConceptualizationRequest, TextCapability, TranslationRequest,
    VisionCapability,
};
use edgequake_tab2rag::{CapabilityError, ImageAsset};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

// ── Workbook fixture ─────────────────────────────────────────────────────────

const SPREADSHEET_NS: &str = "http://schemas.openxmlformats.org/spreadsheetml/2006/main";
const REL_NS: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";
const PKG_REL_NS: &str = "http://schemas.openxmlformats.org/package/2006/relationships";

#[derive(Debug, Clone)]
struct Picture {
    /// Zero-based sheet row of the `from` marker.
    sheet_row: u32,
    col: u32,
    row_offset: i64,
    png: Vec<u8>,
    /// Written as an `absoluteAnchor` with no cell marker.
    absolute: bool,
    /// When false the drawing references a relationship that does not exist.
    linked: bool,
}

/// First-sheet workbook with a header row, data rows and anchored pictures.
#[derive(Debug, Clone, Default)]
pub struct XlsxFixture {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
    pictures: Vec<Picture>,
}

impl XlsxFixture {
    pub fn new(header: &[&str]) -> Self {
        Self {
            header: header.iter().map(|h| h.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn row(mut self, cells: &[&str]) -> Self {
        self.rows.push(cells.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Anchor a picture on a data row (0 = first row under the header).
    ///
    /// Pictures become `xl/media/image1.png`, `image2.png`, … in call order.
    pub fn picture(mut self, data_row: u32, col: u32) -> Self {
        let shade = (self.pictures.len() as u8).wrapping_mul(40);
        self.pictures.push(Picture {
            sheet_row: data_row + 1,
            col,
            row_offset: 0,
            png: solid_png(24, 16, [shade, 90, 160]),
            absolute: false,
            linked: true,
        });
        self
    }

    /// Anchor a picture whose media part holds `payload` instead of a PNG.
    pub fn picture_bytes(mut self, data_row: u32, col: u32, payload: &[u8]) -> Self {
        self = self.picture(data_row, col);
        if let Some(p) = self.pictures.last_mut() {
            p.png = payload.to_vec();
        }
        self
    }

    /// Anchor a picture on the header row.
    pub fn header_picture(mut self, col: u32) -> Self {
        self = self.picture(0, col);
        if let Some(p) = self.pictures.last_mut() {
            p.sheet_row = 0;
        }
        self
    }

    /// A picture positioned in absolute EMU, outside the cell grid.
    pub fn absolute_picture(mut self) -> Self {
        self = self.picture(0, 0);
        if let Some(p) = self.pictures.last_mut() {
            p.absolute = true;
        }
        self
    }

    /// A picture whose `r:embed` has no entry in the drawing rels.
    pub fn unlinked_picture(mut self, data_row: u32, col: u32) -> Self {
        self = self.picture(data_row, col);
        if let Some(p) = self.pictures.last_mut() {
            p.linked = false;
        }
        self
    }

    /// Same as [`XlsxFixture::picture`] but with a vertical offset in EMU.
    pub fn picture_with_offset(mut self, data_row: u32, col: u32, row_offset: i64) -> Self {
        self = self.picture(data_row, col);
        if let Some(p) = self.pictures.last_mut() {
            p.row_offset = row_offset;
        }
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let opts = SimpleFileOptions::default();
        let has_drawing = !self.pictures.is_empty();

        let mut put = |name: &str, body: &[u8]| {
            zip.start_file(name, opts).unwrap();
            zip.write_all(body).unwrap();
        };

        put("[Content_Types].xml", content_types(has_drawing).as_bytes());
        put("_rels/.rels", root_rels().as_bytes());
        put("xl/workbook.xml", workbook().as_bytes());
        put("xl/_rels/workbook.xml.rels", workbook_rels().as_bytes());
        put("xl/worksheets/sheet1.xml", self.sheet(has_drawing).as_bytes());
        if has_drawing {
            put("xl/worksheets/_rels/sheet1.xml.rels", sheet_rels().as_bytes());
            put("xl/drawings/drawing1.xml", self.drawing().as_bytes());
            put("xl/drawings/_rels/drawing1.xml.rels", self.drawing_rels().as_bytes());
            for (i, p) in self.pictures.iter().enumerate().filter(|(_, p)| p.linked) {
                put(&format!("xl/media/image{}.png", i + 1), &p.png);
            }
        }

        zip.finish().unwrap().into_inner()
    }

    fn sheet(&self, has_drawing: bool) -> String {
        let mut xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="{SPREADSHEET_NS}" xmlns:r="{REL_NS}"><sheetData>"#
        );
        let all_rows = std::iter::once(&self.header).chain(self.rows.iter());
        for (r, cells) in all_rows.enumerate() {
            let sheet_row = r + 1;
            xml.push_str(&format!(r#"<row r="{sheet_row}">"#));
            for (c, value) in cells.iter().enumerate() {
                if value.is_empty() {
                    continue;
                }
                xml.push_str(&format!(
                    r#"<c r="{}{sheet_row}" t="inlineStr"><is><t>{}</t></is></c>"#,
                    column_letter(c),
                    escape(value)
                ));
            }
            xml.push_str("</row>");
        }
        xml.push_str("</sheetData>");
        if has_drawing {
            xml.push_str(r#"<drawing r:id="rId1"/>"#);
        }
        xml.push_str("</worksheet>");
        xml
    }

    fn drawing(&self) -> String {
        let mut xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<xdr:wsDr xmlns:xdr="http://schemas.openxmlformats.org/drawingml/2006/spreadsheetDrawing" xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main" xmlns:r="{REL_NS}">"#
        );
        for (i, p) in self.pictures.iter().enumerate() {
            let n = i + 1;
            if p.absolute {
                xml.push_str(&format!(
                    r#"<xdr:absoluteAnchor><xdr:pos x="0" y="0"/><xdr:ext cx="914400" cy="914400"/><xdr:pic><xdr:nvPicPr><xdr:cNvPr id="{id}" name="Picture {n}"/><xdr:cNvPicPr/></xdr:nvPicPr><xdr:blipFill><a:blip r:embed="rId{n}"/></xdr:blipFill><xdr:spPr/></xdr:pic><xdr:clientData/></xdr:absoluteAnchor>"#,
                    id = n + 1,
                ));
                continue;
            }
            xml.push_str(&format!(
                r#"<xdr:twoCellAnchor editAs="oneCell"><xdr:from><xdr:col>{col}</xdr:col><xdr:colOff>0</xdr:colOff><xdr:row>{row}</xdr:row><xdr:rowOff>{off}</xdr:rowOff></xdr:from><xdr:to><xdr:col>{to_col}</xdr:col><xdr:colOff>0</xdr:colOff><xdr:row>{to_row}</xdr:row><xdr:rowOff>0</xdr:rowOff></xdr:to><xdr:pic><xdr:nvPicPr><xdr:cNvPr id="{id}" name="Picture {n}"/><xdr:cNvPicPr/></xdr:nvPicPr><xdr:blipFill><a:blip r:embed="rId{n}"/></xdr:blipFill><xdr:spPr/></xdr:pic><xdr:clientData/></xdr:twoCellAnchor>"#,
                col = p.col,
                row = p.sheet_row,
                off = p.row_offset,
                to_col = p.col + 1,
                to_row = p.sheet_row + 1,
                id = n + 1,
            ));
        }
        xml.push_str("</xdr:wsDr>");
        xml
    }

    fn drawing_rels(&self) -> String {
        let mut xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="{PKG_REL_NS}">"#
        );
        for (i, p) in self.pictures.iter().enumerate() {
            if !p.linked {
                continue;
            }
            let n = i + 1;
            xml.push_str(&format!(
                r#"<Relationship Id="rId{n}" Type="{REL_NS}/image" Target="../media/image{n}.png"/>"#
            ));
        }
        xml.push_str("</Relationships>");
        xml
    }
}

fn content_types(has_drawing: bool) -> String {
    let drawing = if has_drawing {
        r#"<Override PartName="/xl/drawings/drawing1.xml" ContentType="application/vnd.openxmlformats-officedocument.drawing+xml"/>"#
    } else {
        ""
    };
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Default Extension="png" ContentType="image/png"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>{drawing}</Types>"#
    )
}

fn root_rels() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="{PKG_REL_NS}"><Relationship Id="rId1" Type="{REL_NS}/officeDocument" Target="xl/workbook.xml"/></Relationships>"#
    )
}

fn workbook() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="{SPREADSHEET_NS}" xmlns:r="{REL_NS}"><sheets><sheet name="Sheet1" sheetId="1" r:id="rId1"/></sheets></workbook>"#
    )
}

fn workbook_rels() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="{PKG_REL_NS}"><Relationship Id="rId1" Type="{REL_NS}/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#
    )
}

fn sheet_rels() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="{PKG_REL_NS}"><Relationship Id="rId1" Type="{REL_NS}/drawing" Target="../drawings/drawing1.xml"/></Relationships>"#
    )
}

fn column_letter(col: usize) -> char {
    assert!(col < 26, "fixture supports columns A..Z");
    (b'A' + col as u8) as char
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

pub fn solid_png(w: u32, h: u32, rgb: [u8; 3]) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb(rgb)));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

pub fn media(n: usize) -> String {
    format!("xl/media/image{n}.png")
}

// ── Text stub ────────────────────────────────────────────────────────────────

/// Text capability with canned answers. `None` answers fail the call.
///
/// Translation echoes the offered fields unchanged, so records are identical
/// whether or not translation runs.
#[derive(Debug, Default)]
pub struct StubText {
    routing: Option<String>,
    agree: bool,
    rules: Option<String>,
    translate: bool,
    pub analyze_calls: AtomicUsize,
    pub conceptualize_calls: AtomicUsize,
    pub translate_calls: AtomicUsize,
}

impl StubText {
    /// Agrees with whatever schema the heuristics proposed, proposes no
    /// extra rules and echoes translations.
    pub fn agreeable() -> Self {
        Self {
            routing: None,
            agree: true,
            rules: Some(r#"{"rules": {}}"#.to_string()),
            translate: true,
            ..Self::default()
        }
    }

    /// Every call fails.
    pub fn failing() -> Self {
        Self::default()
    }

    pub fn with_routing(mut self, answer: &str) -> Self {
        self.routing = Some(answer.to_string());
        self
    }

    pub fn with_rules(mut self, answer: &str) -> Self {
        self.rules = Some(answer.to_string());
        self
    }

    fn failed(what: &str) -> CapabilityError {
        CapabilityError::CallFailed {
            retries: 0,
            detail: format!("stub {what} refused"),
        }
    }
}

#[async_trait]
impl TextCapability for StubText {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<String, CapabilityError> {
        self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(answer) = &self.routing {
            return Ok(answer.clone());
        }
        if self.agree {
            return Ok(format!(
                r#"```json
{{"schema": "{}", "rationale": "columns match", "confidence": 0.9}}
```"#,
                request.heuristic_schema
            ));
        }
        Err(Self::failed("analysis"))
    }

    async fn conceptualize(
        &self,
        _request: &ConceptualizationRequest,
    ) -> Result<String, CapabilityError> {
        self.conceptualize_calls.fetch_add(1, Ordering::SeqCst);
        self.rules.clone().ok_or_else(|| Self::failed("conceptualization"))
    }

    async fn translate(&self, request: &TranslationRequest) -> Result<String, CapabilityError> {
        self.translate_calls.fetch_add(1, Ordering::SeqCst);
        if !self.translate {
            return Err(Self::failed("translation"));
        }
        serde_json::to_string(&request.fields).map_err(|e| CapabilityError::Unparsable {
            detail: e.to_string(),
        })
    }
}

// ── Vision stub ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum VisionAnswer {
    Describe(String),
    Silent,
    Fail,
    Panic,
}

/// Vision capability keyed by media path, recording call concurrency.
///
/// Images without a scripted answer fail.
#[derive(Debug, Default)]
pub struct StubVision {
    answers: HashMap<String, VisionAnswer>,
    delay: Duration,
    in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
    pub calls: Mutex<Vec<String>>,
}

impl StubVision {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn describe(mut self, media_path: &str, description: &str) -> Self {
        self.answers.insert(
            media_path.to_string(),
            VisionAnswer::Describe(description.to_string()),
        );
        self
    }

    pub fn silent(mut self, media_path: &str) -> Self {
        self.answers.insert(media_path.to_string(), VisionAnswer::Silent);
        self
    }

    pub fn fail(mut self, media_path: &str) -> Self {
        self.answers.insert(media_path.to_string(), VisionAnswer::Fail);
        self
    }

    /// Panic inside the capability call for this image.
    pub fn panic(mut self, media_path: &str) -> Self {
        self.answers.insert(media_path.to_string(), VisionAnswer::Panic);
        self
    }

    /// Hold every call open for `delay` so overlapping calls would show up
    /// in [`StubVision::peak_in_flight`].
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    async fn answer(&self, asset: &ImageAsset) -> Result<Option<String>, CapabilityError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().unwrap().push(asset.media_path.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.answers.get(&asset.media_path) {
            Some(VisionAnswer::Describe(d)) => Ok(Some(d.clone())),
            Some(VisionAnswer::Silent) => Ok(None),
            Some(VisionAnswer::Panic) => panic!("vision client crashed on {}", asset.media_path),
            Some(VisionAnswer::Fail) | None => Err(CapabilityError::CallFailed {
                retries: 0,
                detail: format!("stub vision refused {}", asset.media_path),
            }),
        }
    }
}

#[async_trait]
impl VisionCapability for StubVision {
    async fn describe_image(&self, asset: &ImageAsset) -> Result<Option<String>, CapabilityError> {
        self.answer(asset).await
    }

    async fn describe_images(
        &self,
        assets: &[&ImageAsset],
    ) -> Result<Vec<Option<String>>, CapabilityError> {
        let mut out = Vec::with_capacity(assets.len());
        for asset in assets {
            out.push(self.answer(asset).await?);
        }
        Ok(out)
    }
}
