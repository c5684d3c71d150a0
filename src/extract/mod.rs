//! Document extractors: PDF pipeline charts, HTML pipeline pages, and the
//! column-geometry algorithm they share.

pub mod html;
pub mod layout;
pub mod pdf;

/// One `(asset, stage, indication)` cell recovered from a pipeline chart.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRow {
    pub asset_label: String,
    pub stage: String,
    pub indication: String,
    pub therapeutic_area: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedPipeline {
    /// ISO date parsed from the chart's "as of" header, when present.
    pub as_of_date: Option<String>,
    pub rows: Vec<PipelineRow>,
}
