//! PDF pipeline-chart parsing.
//!
//! A minimal text-state interpreter over the page content streams recovers
//! positioned words (BT/ET, Tf, Td/TD/Tm/TL/T*, Tj/TJ/'/\"), which the
//! layout module then slices into phase columns. Glyph positioning is
//! approximate; the column geometry only needs word origins and font sizes.

use std::sync::LazyLock;

use chrono::NaiveDate;
use lopdf::content::Content;
use lopdf::{Document, Object};
use regex::Regex;

use crate::error::{DossierError, Result};
use crate::extract::layout::{self, Word};
use crate::extract::{ParsedPipeline, PipelineRow};
use crate::sanitize::Classifier;

static AS_OF_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)as of\s+([A-Za-z]+\s+\d{1,2},\s+\d{4})").expect("as-of regex"));

static THERAPEUTIC_AREA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(Oncology|Immunology|Neuroscience|Select Other Areas)\b")
        .expect("therapeutic area regex")
});

#[derive(Debug, Clone)]
pub struct PdfPage {
    pub width: f64,
    pub height: f64,
    pub words: Vec<Word>,
    /// Plain text in reading order, for header scans.
    pub text: String,
}

/// "Selected Innovative Medicines in Development as of January 21, 2026".
pub fn parse_as_of_date(text: &str) -> Option<String> {
    let captured = AS_OF_DATE.captures(text)?.get(1)?.as_str();
    let collapsed = captured.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDate::parse_from_str(&collapsed, "%B %d, %Y")
        .ok()
        .map(|d| d.to_string())
}

/// Therapeutic-area headline, e.g. "Oncology (1 of 3)".
pub fn therapeutic_area(text: &str) -> Option<String> {
    for line in text.lines() {
        if let Some(captures) = THERAPEUTIC_AREA.captures(line.trim()) {
            return Some(title_case(captures.get(1)?.as_str()));
        }
    }
    None
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Full chart extraction: per page, rebuild the phase columns and walk each
/// column's lines, then drop footer junk rows.
pub fn parse_pipeline_pdf(bytes: &[u8], classifier: &Classifier) -> Result<ParsedPipeline> {
    let pages = load_pages(bytes)?;
    let as_of_date = pages.first().and_then(|p| parse_as_of_date(&p.text));

    let mut rows: Vec<PipelineRow> = Vec::new();
    for page in &pages {
        let area = therapeutic_area(&page.text);
        let columns = layout::phase_columns(&page.words, page.width);
        let body = layout::body_words(&page.words, page.height);
        let median = layout::median_size(&body);

        for column in &columns {
            let column_words: Vec<&Word> = body
                .iter()
                .copied()
                .filter(|w| column.x0 <= w.x0 && w.x0 < column.x1)
                .collect();
            let lines = layout::group_lines(&column_words);
            if lines.is_empty() {
                continue;
            }
            let column_left = lines
                .iter()
                .map(|l| l.x0)
                .fold(f64::INFINITY, f64::min);
            rows.extend(layout::collect_rows(
                &lines,
                column.stage,
                area.as_deref(),
                median,
                column_left,
                classifier,
            ));
        }
    }

    rows.retain(|row| {
        let low = row.indication.to_lowercase();
        !low.starts_with("strategic partnerships") && !low.starts_with("*this is not")
    });

    Ok(ParsedPipeline { as_of_date, rows })
}

pub fn load_pages(bytes: &[u8]) -> Result<Vec<PdfPage>> {
    let doc = Document::load_mem(bytes)?;
    let mut pages = Vec::new();
    for (_, page_id) in doc.get_pages() {
        let (width, height) = media_box(&doc, page_id);
        let content = doc.get_page_content(page_id)?;
        let words = interpret_content(&content, height)?;
        let text = page_text(&words);
        pages.push(PdfPage { width, height, words, text });
    }
    if pages.is_empty() {
        return Err(DossierError::Pdf("document has no pages".to_string()));
    }
    Ok(pages)
}

/// MediaBox of the page or its closest ancestor; US Letter landscape when
/// absent.
fn media_box(doc: &Document, page_id: lopdf::ObjectId) -> (f64, f64) {
    let mut current = Some(page_id);
    while let Some(id) = current {
        let Ok(dict) = doc.get_object(id).and_then(Object::as_dict) else {
            break;
        };
        if let Ok(raw) = dict.get(b"MediaBox")
            && let Ok(values) = raw.as_array()
            && values.len() == 4
        {
            let nums: Vec<f64> = values.iter().filter_map(number).collect();
            if nums.len() == 4 {
                return ((nums[2] - nums[0]).abs(), (nums[3] - nums[1]).abs());
            }
        }
        current = dict
            .get(b"Parent")
            .ok()
            .and_then(|p| p.as_reference().ok());
    }
    (792.0, 612.0)
}

fn number(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(r) => Some(f64::from(*r)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
struct Matrix {
    a: f64,
    b: f64,
    c: f64,
    d: f64,
    e: f64,
    f: f64,
}

impl Matrix {
    const IDENTITY: Self = Self { a: 1.0, b: 0.0, c: 0.0, d: 1.0, e: 0.0, f: 0.0 };

    fn translate(tx: f64, ty: f64) -> Self {
        Self { e: tx, f: ty, ..Self::IDENTITY }
    }

    fn mul(&self, rhs: &Self) -> Self {
        Self {
            a: self.a * rhs.a + self.b * rhs.c,
            b: self.a * rhs.b + self.b * rhs.d,
            c: self.c * rhs.a + self.d * rhs.c,
            d: self.c * rhs.b + self.d * rhs.d,
            e: self.e * rhs.a + self.f * rhs.c + rhs.e,
            f: self.e * rhs.b + self.f * rhs.d + rhs.f,
        }
    }

    /// Vertical scale factor, applied to the nominal font size.
    fn scale_y(&self) -> f64 {
        (self.b * self.b + self.d * self.d).sqrt()
    }
}

struct TextState {
    text_matrix: Matrix,
    line_matrix: Matrix,
    font_size: f64,
    leading: f64,
}

impl TextState {
    fn new() -> Self {
        Self {
            text_matrix: Matrix::IDENTITY,
            line_matrix: Matrix::IDENTITY,
            font_size: 0.0,
            leading: 0.0,
        }
    }

    fn next_line(&mut self, tx: f64, ty: f64) {
        self.line_matrix = Matrix::translate(tx, ty).mul(&self.line_matrix);
        self.text_matrix = self.line_matrix;
    }
}

/// Walk the content stream and emit one `Word` per whitespace-separated run
/// of shown text. Horizontal advance is approximated from the font size.
fn interpret_content(data: &[u8], page_height: f64) -> Result<Vec<Word>> {
    let content =
        Content::decode(data).map_err(|e| DossierError::Pdf(format!("content stream: {e}")))?;

    let mut words = Vec::new();
    let mut state = TextState::new();
    let mut in_text = false;

    for op in &content.operations {
        let operands = &op.operands;
        match op.operator.as_str() {
            "BT" => {
                in_text = true;
                state.text_matrix = Matrix::IDENTITY;
                state.line_matrix = Matrix::IDENTITY;
            }
            "ET" => in_text = false,
            "Tf" => {
                if let Some(size) = operands.get(1).and_then(number) {
                    state.font_size = size;
                }
            }
            "TL" => {
                if let Some(leading) = operands.first().and_then(number) {
                    state.leading = leading;
                }
            }
            "Td" => {
                if let (Some(tx), Some(ty)) = (
                    operands.first().and_then(number),
                    operands.get(1).and_then(number),
                ) {
                    state.next_line(tx, ty);
                }
            }
            "TD" => {
                if let (Some(tx), Some(ty)) = (
                    operands.first().and_then(number),
                    operands.get(1).and_then(number),
                ) {
                    state.leading = -ty;
                    state.next_line(tx, ty);
                }
            }
            "Tm" => {
                let nums: Vec<f64> = operands.iter().filter_map(number).collect();
                if nums.len() == 6 {
                    let m = Matrix {
                        a: nums[0],
                        b: nums[1],
                        c: nums[2],
                        d: nums[3],
                        e: nums[4],
                        f: nums[5],
                    };
                    state.text_matrix = m;
                    state.line_matrix = m;
                }
            }
            "T*" => state.next_line(0.0, -state.leading),
            "Tj" => {
                if in_text && let Some(Object::String(bytes, _)) = operands.first() {
                    show_text(bytes, &mut state, page_height, &mut words);
                }
            }
            "'" => {
                state.next_line(0.0, -state.leading);
                if in_text && let Some(Object::String(bytes, _)) = operands.first() {
                    show_text(bytes, &mut state, page_height, &mut words);
                }
            }
            "\"" => {
                state.next_line(0.0, -state.leading);
                if in_text && let Some(Object::String(bytes, _)) = operands.get(2) {
                    show_text(bytes, &mut state, page_height, &mut words);
                }
            }
            "TJ" => {
                if in_text && let Some(Object::Array(items)) = operands.first() {
                    for item in items {
                        match item {
                            Object::String(bytes, _) => {
                                show_text(bytes, &mut state, page_height, &mut words)
                            }
                            _ => {
                                if let Some(adjust) = number(item) {
                                    let dx = -adjust / 1000.0 * state.font_size;
                                    state.text_matrix =
                                        Matrix::translate(dx, 0.0).mul(&state.text_matrix);
                                }
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }
    Ok(words)
}

// Average glyph width as a fraction of the font size, for advance estimates.
const GLYPH_ASPECT: f64 = 0.5;

fn show_text(bytes: &[u8], state: &mut TextState, page_height: f64, words: &mut Vec<Word>) {
    let decoded = decode_string(bytes);
    if decoded.is_empty() {
        return;
    }
    let size = state.font_size * state.text_matrix.scale_y();
    let advance = state.font_size.max(1.0) * GLYPH_ASPECT;

    let mut offset = 0usize;
    for chunk in decoded.split(' ') {
        if !chunk.is_empty() {
            let x0 = state.text_matrix.e + offset as f64 * advance;
            words.push(Word {
                text: chunk.to_string(),
                x0,
                top: page_height - state.text_matrix.f,
                size,
            });
        }
        offset += chunk.chars().count() + 1;
    }

    let total = decoded.chars().count() as f64 * advance;
    state.text_matrix = Matrix::translate(total, 0.0).mul(&state.text_matrix);
}

/// Best-effort string decoding: pipeline charts ship standard encodings, so
/// printable Latin text survives a lossy pass and everything else is dropped.
fn decode_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .chars()
        .filter(|c| !c.is_control() && *c != '\u{fffd}')
        .collect()
}

fn page_text(words: &[Word]) -> String {
    let refs: Vec<&Word> = words.iter().collect();
    layout::group_lines(&refs)
        .iter()
        .map(|line| line.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_of_date_is_parsed_to_iso() {
        let text = "Selected Innovative Medicines in Development as of January 21, 2026";
        assert_eq!(parse_as_of_date(text).as_deref(), Some("2026-01-21"));
        assert_eq!(parse_as_of_date("no date here"), None);
        assert_eq!(parse_as_of_date("as of Foober 3, 2026"), None);
    }

    #[test]
    fn therapeutic_area_headline_is_title_cased() {
        assert_eq!(
            therapeutic_area("Oncology (1 of 3)\nsome other line").as_deref(),
            Some("Oncology")
        );
        assert_eq!(
            therapeutic_area("header\nSELECT OTHER AREAS continued").as_deref(),
            Some("Select Other Areas")
        );
        assert_eq!(therapeutic_area("Cardiology overview"), None);
    }

    #[test]
    fn interpreter_places_words_with_flipped_y() {
        // One text block at (100, 700) in 10pt, showing two words.
        let stream = b"BT /F1 10 Tf 100 700 Td (JNJ-1900 radioenhancer) Tj ET";
        let words = interpret_content(stream, 792.0).expect("valid stream");
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].text, "JNJ-1900");
        assert_eq!(words[0].x0, 100.0);
        assert_eq!(words[0].top, 92.0);
        assert_eq!(words[0].size, 10.0);
        assert_eq!(words[1].text, "radioenhancer");
        assert!(words[1].x0 > words[0].x0);
    }

    #[test]
    fn tm_scaling_affects_effective_size() {
        let stream = b"BT /F1 10 Tf 2 0 0 2 50 500 Tm (TALVEY) Tj ET";
        let words = interpret_content(stream, 792.0).expect("valid stream");
        assert_eq!(words.len(), 1);
        assert_eq!(words[0].size, 20.0);
        assert_eq!(words[0].x0, 50.0);
        assert_eq!(words[0].top, 292.0);
    }

    #[test]
    fn tstar_advances_to_the_next_line() {
        let stream = b"BT /F1 8 Tf 12 TL 100 700 Td (first) Tj T* (second) Tj ET";
        let words = interpret_content(stream, 792.0).expect("valid stream");
        assert_eq!(words.len(), 2);
        assert_eq!(words[1].top - words[0].top, 12.0);
        assert_eq!(words[1].x0, 100.0);
    }
}
