//! HTML pipeline pages: locating the report PDF or chart image, flattening
//! page text, and loading curated supplemental assets from YAML.

use std::fs;
use std::path::Path;

use scraper::{Html, Selector};
use serde::Deserialize;

use crate::error::{DossierError, Result};

fn anchor_selector() -> Selector {
    Selector::parse("a").expect("anchor selector")
}

/// Direct link to the pipeline report PDF: an anchor ending in `.pdf` whose
/// href or text mentions the pipeline.
pub fn find_pdf_url(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    for anchor in document.select(&anchor_selector()) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let href_low = href.to_lowercase();
        if !href_low.ends_with(".pdf") {
            continue;
        }
        let text = anchor.text().collect::<String>().trim().to_lowercase();
        if href_low.contains("pipeline") || text.contains("pipeline") || text.contains("download report")
        {
            return Some(href.to_string());
        }
    }
    None
}

fn is_pipeline_image(url: &str) -> bool {
    let low = url.to_lowercase();
    low.contains("pipeline")
        && (low.ends_with(".png") || low.ends_with(".jpg") || low.ends_with(".jpeg"))
}

/// Pipeline chart image, either inline or wrapped in a link.
pub fn find_pipeline_image_url(html: &str) -> Option<String> {
    let document = Html::parse_document(html);

    let img = Selector::parse("img").expect("img selector");
    for node in document.select(&img) {
        if let Some(src) = node.value().attr("src")
            && is_pipeline_image(src)
        {
            return Some(src.to_string());
        }
    }
    for anchor in document.select(&anchor_selector()) {
        if let Some(href) = anchor.value().attr("href")
            && is_pipeline_image(href)
        {
            return Some(href.to_string());
        }
    }
    None
}

/// Visible page text with whitespace collapsed, for alias scans.
pub fn page_text(html: &str) -> String {
    let document = Html::parse_document(html);
    document
        .root_element()
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Resolve a scraped href against the page it came from.
pub fn absolutize(base_page: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    if let Some(rest) = base_page.strip_prefix("https://").or_else(|| base_page.strip_prefix("http://"))
        && let Some(host_end) = rest.find('/')
    {
        let origin = &base_page[..base_page.len() - rest.len() + host_end];
        if let Some(path) = href.strip_prefix('/') {
            return format!("{origin}/{path}");
        }
    }
    if href.starts_with('/') {
        return format!("{}{href}", base_page.trim_end_matches('/'));
    }
    format!("{}/{href}", base_page.trim_end_matches('/'))
}

#[derive(Debug, Clone, Deserialize)]
pub struct CuratedIndication {
    pub indication: String,
    #[serde(default = "default_stage")]
    pub stage: String,
    #[serde(default)]
    pub therapeutic_area: Option<String>,
}

fn default_stage() -> String {
    "Unknown".to_string()
}

/// Hand-maintained seed for companies whose chart is an image we cannot
/// parse. Curated entries are authoritative for stages and indications.
#[derive(Debug, Clone, Deserialize)]
pub struct CuratedAsset {
    pub name: String,
    #[serde(default)]
    pub modality: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub indications: Vec<CuratedIndication>,
    #[serde(default)]
    pub as_of_date: Option<String>,
    #[serde(default = "default_disclosed")]
    pub is_disclosed: bool,
}

fn default_disclosed() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct CuratedFile {
    #[serde(default)]
    assets: Vec<CuratedAsset>,
}

/// Missing file means no curated seed, which is fine.
pub fn load_curated_assets(path: &Path) -> Result<Vec<CuratedAsset>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path)?;
    let parsed: CuratedFile = serde_yaml::from_str(&text)
        .map_err(|e| DossierError::Config(format!("curated assets {}: {e}", path.display())))?;
    Ok(parsed.assets)
}
