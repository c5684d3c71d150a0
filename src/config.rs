use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{DossierError, Result};
use crate::sanitize::LexiconOverlay;

/// Runtime knobs with in-code defaults and an optional YAML overlay.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub db_path: PathBuf,
    pub evidence_root: PathBuf,

    pub http_timeout_secs: u64,
    pub http_user_agent: String,

    pub registry_page_size: u32,
    pub registry_max_pages_per_query: u32,
    pub registry_sleep_ms: u64,
    /// Overall-status filter for registry queries; empty means the built-in
    /// active-study set.
    pub registry_statuses: Vec<String>,

    pub fuzzy_threshold: u32,
    pub min_alias_len_for_trial_search: usize,
    pub bootstrap_min_trials: usize,

    pub probe_max_quarters: u32,

    pub oracle_enabled: bool,
    pub oracle_model: String,
    pub oracle_max_calls_per_run: u32,
    pub oracle_cache_dir: PathBuf,

    pub lexicon: LexiconOverlay,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/dossier.db"),
            evidence_root: PathBuf::from("data/evidence"),
            http_timeout_secs: 45,
            http_user_agent: "dossier/0.2 (contact: ops@example.com)".to_string(),
            registry_page_size: 100,
            registry_max_pages_per_query: 50,
            registry_sleep_ms: 200,
            registry_statuses: Vec::new(),
            fuzzy_threshold: 92,
            min_alias_len_for_trial_search: 4,
            bootstrap_min_trials: 2,
            probe_max_quarters: 8,
            oracle_enabled: false,
            oracle_model: "gemini-1.5-flash".to_string(),
            oracle_max_calls_per_run: 200,
            oracle_cache_dir: PathBuf::from("data/oracle_cache"),
            lexicon: LexiconOverlay::default(),
        }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => {
                let content = fs::read_to_string(path)?;
                Ok(serde_yaml::from_str(&content)?)
            }
            Some(path) => Err(DossierError::Config(format!(
                "settings file not found: {}",
                path.display()
            ))),
            None => Ok(Self::default()),
        }
    }

    /// API key for the oracle collaborator, never stored in config files.
    pub fn oracle_api_key(&self) -> Option<String> {
        std::env::var("DOSSIER_ORACLE_API_KEY").ok().filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Page that links to the pipeline PDF; the link is discovered by scraping.
    HtmlPdfLink,
    /// Direct PDF URL.
    Pdf,
    /// Page whose pipeline chart is an image; text plus curated seeds apply.
    HtmlImage,
    /// Plain HTML text scan.
    HtmlText,
}

#[derive(Debug, Clone)]
pub struct PipelineSource {
    pub kind: SourceKind,
    pub url: String,
    pub label: Option<String>,
    /// Explicit artifact URL that bypasses discovery entirely.
    pub override_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompanyConfig {
    pub company_id: String,
    pub name: String,
    pub pipeline_sources: Vec<PipelineSource>,
    pub trial_sponsor_aliases: Vec<String>,
    pub curated_assets_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawCompanies {
    #[serde(default)]
    companies: Vec<RawCompany>,
}

#[derive(Debug, Deserialize)]
struct RawCompany {
    company_id: String,
    name: String,
    #[serde(default)]
    pipeline_sources: Vec<RawSource>,
    #[serde(default)]
    trial_sponsor_aliases: Vec<String>,
    #[serde(default)]
    curated_assets_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawSource {
    #[serde(rename = "type")]
    kind: String,
    url: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    override_url: Option<String>,
}

impl RawSource {
    fn into_source(self) -> Result<PipelineSource> {
        let kind = match self.kind.as_str() {
            "html_pdf_link" => SourceKind::HtmlPdfLink,
            "pdf" => SourceKind::Pdf,
            "html_image" => SourceKind::HtmlImage,
            "html_text" => SourceKind::HtmlText,
            other => {
                return Err(DossierError::Config(format!("unknown source type `{other}`")));
            }
        };
        Ok(PipelineSource {
            kind,
            url: self.url,
            label: self.label,
            override_url: self.override_url,
        })
    }
}

pub fn load_companies(path: &Path) -> Result<BTreeMap<String, CompanyConfig>> {
    let content = fs::read_to_string(path)?;
    parse_companies(&content)
}

fn parse_companies(content: &str) -> Result<BTreeMap<String, CompanyConfig>> {
    let raw: RawCompanies = serde_yaml::from_str(content)?;
    let mut out = BTreeMap::new();
    for company in raw.companies {
        let mut sources = Vec::with_capacity(company.pipeline_sources.len());
        for source in company.pipeline_sources {
            sources.push(source.into_source()?);
        }
        out.insert(
            company.company_id.clone(),
            CompanyConfig {
                company_id: company.company_id,
                name: company.name,
                pipeline_sources: sources,
                trial_sponsor_aliases: company.trial_sponsor_aliases,
                curated_assets_file: company.curated_assets_file,
            },
        );
    }
    Ok(out)
}
