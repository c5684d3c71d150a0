//! Column geometry over positioned words.
//!
//! Pipeline charts encode the development stage as horizontal position, so
//! the table structure has to be rebuilt from word coordinates: locate the
//! phase column boundaries from the header row, slice body words into
//! columns, regroup them into visual lines, and classify each line as an
//! asset name or indication text.

use crate::extract::PipelineRow;
use crate::sanitize::{self, Classifier};

/// A positioned word with its font size, as reported by the PDF interpreter.
#[derive(Debug, Clone, PartialEq)]
pub struct Word {
    pub text: String,
    pub x0: f64,
    pub top: f64,
    pub size: f64,
}

/// One visual line after regrouping a column's words.
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub text: String,
    pub x0: f64,
    pub top: f64,
    pub avg_size: f64,
}

/// Header words live above this; the footer band is the last 80 points.
pub const BODY_TOP: f64 = 90.0;
pub const FOOTER_BAND: f64 = 80.0;
const Y_TOL: f64 = 3.0;

pub const STAGE_NAMES: [&str; 4] = ["Phase 1", "Phase 2", "Phase 3", "Registration"];

/// A stage column with its horizontal extent.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub stage: &'static str,
    pub x0: f64,
    pub x1: f64,
}

/// Column boundaries from the header row: the x-positions of the three
/// `Phase` headers and the `Registration` header, with boundaries at their
/// midpoints. Falls back to a proportional four-way split of the right 70%
/// of the page when the headers cannot be located confidently.
pub fn phase_columns(words: &[Word], page_width: f64) -> Vec<Column> {
    let mut phase_xs: Vec<f64> = Vec::new();
    let mut registration_x: Option<f64> = None;

    for word in words.iter().filter(|w| w.top < BODY_TOP) {
        let text = word.text.trim();
        if text.eq_ignore_ascii_case("phase") {
            phase_xs.push(word.x0);
        } else if text.to_lowercase().starts_with("registration") {
            registration_x = Some(word.x0);
        }
    }
    phase_xs.sort_by(|a, b| a.total_cmp(b));

    if phase_xs.len() < 3 || registration_x.is_none() {
        return proportional_columns(page_width);
    }

    let (p1, p2, p3) = (phase_xs[0], phase_xs[1], phase_xs[2]);
    let reg = registration_x.unwrap_or(page_width);
    let b12 = (p1 + p2) / 2.0;
    let b23 = (p2 + p3) / 2.0;
    let b3r = (p3 + reg) / 2.0;
    let left = p1 - 40.0;
    let right = page_width - 10.0;
    vec![
        Column { stage: STAGE_NAMES[0], x0: left, x1: b12 },
        Column { stage: STAGE_NAMES[1], x0: b12, x1: b23 },
        Column { stage: STAGE_NAMES[2], x0: b23, x1: b3r },
        Column { stage: STAGE_NAMES[3], x0: b3r, x1: right },
    ]
}

fn proportional_columns(page_width: f64) -> Vec<Column> {
    let left = page_width * 0.25;
    let right = page_width * 0.95;
    let col_width = (right - left) / 4.0;
    STAGE_NAMES
        .iter()
        .enumerate()
        .map(|(i, stage)| Column {
            stage,
            x0: left + i as f64 * col_width,
            x1: if i == 3 { right } else { left + (i + 1) as f64 * col_width },
        })
        .collect()
}

/// Body words only: header and footer bands excluded.
pub fn body_words(words: &[Word], page_height: f64) -> Vec<&Word> {
    words
        .iter()
        .filter(|w| {
            !w.text.trim().is_empty() && w.top >= BODY_TOP && w.top <= page_height - FOOTER_BAND
        })
        .collect()
}

pub fn median_size(words: &[&Word]) -> f64 {
    let mut sizes: Vec<f64> = words.iter().map(|w| w.size).filter(|s| *s > 0.0).collect();
    if sizes.is_empty() {
        return 10.0;
    }
    sizes.sort_by(|a, b| a.total_cmp(b));
    sizes[sizes.len() / 2]
}

/// Regroup column words into visual lines: cluster by vertical proximity,
/// then order each cluster left to right.
pub fn group_lines(words: &[&Word]) -> Vec<Line> {
    let mut sorted: Vec<&Word> = words.to_vec();
    sorted.sort_by(|a, b| a.top.total_cmp(&b.top).then(a.x0.total_cmp(&b.x0)));

    let mut clusters: Vec<Vec<&Word>> = Vec::new();
    for word in sorted {
        match clusters.last_mut() {
            Some(cluster) if (word.top - cluster[0].top).abs() <= Y_TOL => cluster.push(word),
            _ => clusters.push(vec![word]),
        }
    }

    clusters
        .into_iter()
        .filter_map(|mut cluster| {
            cluster.sort_by(|a, b| a.x0.total_cmp(&b.x0));
            let text = cluster
                .iter()
                .map(|w| w.text.as_str())
                .collect::<Vec<_>>()
                .join(" ")
                .trim()
                .to_string();
            if text.is_empty() {
                return None;
            }
            let avg_size = cluster.iter().map(|w| w.size).sum::<f64>() / cluster.len() as f64;
            Some(Line {
                text,
                x0: cluster[0].x0,
                top: cluster[0].top,
                avg_size,
            })
        })
        .collect()
}

/// Whether a line starts a new asset block rather than continuing the
/// current asset's indication text. Every positive branch is gated by the
/// classifier so indication-like or acronym-like lines are never promoted.
pub fn is_asset_line(line: &Line, median: f64, column_left: f64, classifier: &Classifier) -> bool {
    let text = line.text.trim();
    if text.is_empty() {
        return false;
    }
    let Some(cleaned) = classifier.sanitize_asset_label(text) else {
        return false;
    };
    if !classifier.is_plausible_asset_label(&cleaned) {
        return false;
    }

    if sanitize::is_program_code(&cleaned) {
        return true;
    }
    // Asset names hug the column's left edge; wrapped indication text is
    // usually indented.
    if (line.x0 - column_left).abs() <= 6.0 && line.avg_size >= median {
        return true;
    }
    // Asset names render visually larger than indication text.
    if line.avg_size >= median + 0.6 {
        return true;
    }
    if sanitize::has_brand_generic_shape(&cleaned) {
        return true;
    }
    // Single generic-name token ("icotrokinra").
    if !cleaned.contains(' ')
        && (4..=25).contains(&cleaned.len())
        && cleaned.chars().any(|c| c.is_ascii_lowercase())
    {
        return true;
    }
    // ALL-CAPS brand name.
    if (3..=45).contains(&cleaned.len())
        && cleaned.chars().any(|c| c.is_ascii_alphabetic())
        && !cleaned.chars().any(|c| c.is_ascii_lowercase())
    {
        return true;
    }
    false
}

/// Walk one column's lines top to bottom, flushing an asset row whenever a
/// new asset line begins and at column end.
pub fn collect_rows(
    lines: &[Line],
    stage: &str,
    therapeutic_area: Option<&str>,
    median: f64,
    column_left: f64,
    classifier: &Classifier,
) -> Vec<PipelineRow> {
    let mut rows = Vec::new();
    let mut current_asset: Option<String> = None;
    let mut indication_parts: Vec<String> = Vec::new();

    let mut flush = |asset: &Option<String>, parts: &mut Vec<String>, rows: &mut Vec<PipelineRow>| {
        if let Some(asset) = asset
            && !parts.is_empty()
        {
            rows.push(PipelineRow {
                asset_label: asset.clone(),
                stage: stage.to_string(),
                indication: parts.join(" ").trim().to_string(),
                therapeutic_area: therapeutic_area.map(ToOwned::to_owned),
            });
        }
        parts.clear();
    };

    for line in lines {
        if is_asset_line(line, median, column_left, classifier) {
            flush(&current_asset, &mut indication_parts, &mut rows);
            current_asset = Some(line.text.trim().to_string());
        } else if current_asset.is_some() {
            indication_parts.push(line.text.trim().to_string());
        }
    }
    flush(&current_asset, &mut indication_parts, &mut rows);
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sanitize::Lexicon;

    fn classifier() -> Classifier {
        Classifier::new(Lexicon::default())
    }

    fn word(text: &str, x0: f64, top: f64, size: f64) -> Word {
        Word { text: text.to_string(), x0, top, size }
    }

    #[test]
    fn header_positions_drive_column_boundaries() {
        let words = vec![
            word("Phase", 150.0, 40.0, 12.0),
            word("1", 185.0, 40.0, 12.0),
            word("Phase", 300.0, 40.0, 12.0),
            word("2", 335.0, 40.0, 12.0),
            word("Phase", 450.0, 40.0, 12.0),
            word("3", 485.0, 40.0, 12.0),
            word("Registration", 600.0, 40.0, 12.0),
        ];
        let columns = phase_columns(&words, 792.0);
        assert_eq!(columns.len(), 4);
        assert_eq!(columns[0].stage, "Phase 1");
        assert_eq!(columns[0].x0, 110.0);
        assert_eq!(columns[0].x1, 225.0);
        assert_eq!(columns[1].x1, 375.0);
        assert_eq!(columns[2].x1, 525.0);
        assert_eq!(columns[3].x1, 782.0);
    }

    #[test]
    fn missing_headers_fall_back_to_proportional_split() {
        let columns = phase_columns(&[], 800.0);
        assert_eq!(columns.len(), 4);
        assert_eq!(columns[0].x0, 200.0);
        assert_eq!(columns[3].x1, 760.0);
        // Columns tile the band with no gaps.
        for pair in columns.windows(2) {
            assert_eq!(pair[0].x1, pair[1].x0);
        }
    }

    #[test]
    fn lines_cluster_by_vertical_proximity() {
        let words = vec![
            word("Non-small", 100.0, 200.0, 8.0),
            word("cell", 150.0, 201.5, 8.0),
            word("lung", 172.0, 199.0, 8.0),
            word("cancer", 200.0, 230.0, 8.0),
        ];
        let refs: Vec<&Word> = words.iter().collect();
        let lines = group_lines(&refs);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "Non-small cell lung");
        assert_eq!(lines[1].text, "cancer");
    }

    #[test]
    fn program_code_line_is_an_asset() {
        let line = Line { text: "JNJ-1900 (NBTXR3)".to_string(), x0: 100.0, top: 200.0, avg_size: 8.0 };
        assert!(is_asset_line(&line, 9.0, 100.0, &classifier()));
    }

    #[test]
    fn indication_text_is_never_an_asset() {
        let c = classifier();
        for text in [
            "Non-small cell lung cancer",
            "treatment of patients with relapsed disease",
            "PulmonaryArterialH",
        ] {
            let line = Line { text: text.to_string(), x0: 100.0, top: 200.0, avg_size: 12.0 };
            assert!(!is_asset_line(&line, 8.0, 100.0, &c), "{text} misread as asset");
        }
    }

    #[test]
    fn larger_font_promotes_a_name() {
        let big = Line { text: "icotrokinra".to_string(), x0: 130.0, top: 200.0, avg_size: 10.0 };
        assert!(is_asset_line(&big, 9.0, 100.0, &classifier()));
    }

    #[test]
    fn rows_flush_on_each_new_asset_and_at_column_end() {
        let c = classifier();
        let lines = vec![
            Line { text: "JNJ-1900 (NBTXR3)".to_string(), x0: 100.0, top: 100.0, avg_size: 10.0 },
            Line { text: "Head and neck cancer".to_string(), x0: 104.0, top: 112.0, avg_size: 8.0 },
            Line { text: "TALVEY (talquetamab)".to_string(), x0: 100.0, top: 130.0, avg_size: 10.0 },
            Line { text: "Relapsed multiple myeloma".to_string(), x0: 104.0, top: 142.0, avg_size: 8.0 },
        ];
        let rows = collect_rows(&lines, "Phase 2", Some("Oncology"), 8.0, 100.0, &c);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].asset_label, "JNJ-1900 (NBTXR3)");
        assert_eq!(rows[0].indication, "Head and neck cancer");
        assert_eq!(rows[1].asset_label, "TALVEY (talquetamab)");
        assert_eq!(rows[1].stage, "Phase 2");
        assert_eq!(rows[1].therapeutic_area.as_deref(), Some("Oncology"));
    }

    #[test]
    fn asset_without_indication_text_produces_no_row() {
        let c = classifier();
        let lines = vec![Line {
            text: "JNJ-1900".to_string(),
            x0: 100.0,
            top: 100.0,
            avg_size: 10.0,
        }];
        assert!(collect_rows(&lines, "Phase 1", None, 8.0, 100.0, &c).is_empty());
    }
}
