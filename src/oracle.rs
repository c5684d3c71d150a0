//! LLM fallback for borderline pipeline labels.
//!
//! The oracle never invents names: every canonical name or alias it returns
//! must be derivable as a substring of the label or its context after
//! normalization, or it is discarded. Verdicts are cached on disk and the
//! per-run call budget is hard.

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::config::Settings;
use crate::error::Result;
use crate::normalize::norm_text;

static JSON_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("json object regex"));

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OracleVerdict {
    pub is_asset: bool,
    pub canonical_name: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl OracleVerdict {
    pub fn non_asset() -> Self {
        Self::default()
    }
}

/// First JSON object embedded in a model response, if any.
fn extract_json_object(text: &str) -> Option<Value> {
    let found = JSON_OBJECT.find(text)?;
    serde_json::from_str(found.as_str()).ok()
}

fn verdict_key(company_id: &str, raw_label: &str, context: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(company_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(raw_label.as_bytes());
    hasher.update(b"\n");
    hasher.update(context.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Drop anything the model returned that does not appear, normalized, inside
/// the raw label. Context feeds the prompt and the cache key but never
/// counts toward derivability; a name echoed from a neighboring line is
/// still a hallucination.
fn enforce_derivable(mut verdict: OracleVerdict, raw_label: &str) -> OracleVerdict {
    let haystack = norm_text(raw_label);
    let derivable = |s: &str| {
        let normed = norm_text(s);
        !normed.is_empty() && haystack.contains(&normed)
    };

    verdict.aliases.retain(|alias| derivable(alias));
    match &verdict.canonical_name {
        Some(name) if verdict.is_asset && derivable(name) => {}
        _ => {
            verdict.is_asset = false;
            verdict.canonical_name = None;
            verdict.aliases.clear();
        }
    }
    verdict
}

fn parse_verdict(raw: &Value) -> OracleVerdict {
    let is_asset = raw.get("is_asset").and_then(Value::as_bool).unwrap_or(false);
    if !is_asset {
        return OracleVerdict::non_asset();
    }
    OracleVerdict {
        is_asset: true,
        canonical_name: raw
            .get("canonical_name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned),
        aliases: raw
            .get("aliases")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn build_prompt(raw_label: &str, context: &str) -> String {
    format!(
        "You are cleaning extracted pharma pipeline labels.\n\
         \n\
         Task:\n\
         - Decide whether RAW_LABEL is a drug/program/intervention name (asset) \
         or an indication/disease/other non-asset.\n\
         - If it is an asset: return a cleaned canonical name and 1-10 aliases \
         that appear directly in the label.\n\
         - If it is NOT an asset: return is_asset=false.\n\
         \n\
         Rules:\n\
         - Do NOT invent or guess new drug names.\n\
         - Only normalize/clean/trim strings that appear in the label.\n\
         - If uncertain, set is_asset=false.\n\
         - Output MUST be valid JSON and NOTHING ELSE.\n\
         \n\
         Return JSON schema:\n\
         {{\n  \"is_asset\": true|false,\n  \"canonical_name\": \"...\" | null,\n  \"aliases\": [\"...\", ...]\n}}\n\
         \n\
         RAW_LABEL: {raw_label}\n\
         CONTEXT (nearby lines from same source column):\n{context}\n"
    )
}

pub struct Oracle {
    client: reqwest::blocking::Client,
    enabled: bool,
    model: String,
    api_key: Option<String>,
    cache_dir: PathBuf,
    budget: u32,
    calls: Cell<u32>,
}

impl Oracle {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(settings.http_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            enabled: settings.oracle_enabled,
            model: settings.oracle_model.clone(),
            api_key: settings.oracle_api_key(),
            cache_dir: settings.oracle_cache_dir.clone(),
            budget: settings.oracle_max_calls_per_run,
            calls: Cell::new(0),
        })
    }

    pub fn calls_made(&self) -> u32 {
        self.calls.get()
    }

    fn cache_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{key}.json"))
    }

    fn read_cache(&self, path: &Path) -> Option<OracleVerdict> {
        let text = fs::read_to_string(path).ok()?;
        serde_json::from_str(&text).ok()
    }

    fn write_cache(&self, path: &Path, verdict: &OracleVerdict) {
        if fs::create_dir_all(&self.cache_dir).is_err() {
            return;
        }
        if let Ok(text) = serde_json::to_string_pretty(verdict) {
            // A lost cache entry only costs a repeat call later.
            let _ = fs::write(path, text);
        }
    }

    /// `None` means the oracle has no opinion: disabled, keyless, or out of
    /// budget. A cached verdict never counts against the budget.
    pub fn classify(
        &self,
        company_id: &str,
        raw_label: &str,
        context: &str,
    ) -> Option<OracleVerdict> {
        if !self.enabled {
            return None;
        }
        let raw_label = raw_label.trim();
        if raw_label.is_empty() {
            return Some(OracleVerdict::non_asset());
        }
        let context = context.trim();

        let key = verdict_key(company_id, raw_label, context);
        let cache_file = self.cache_path(&key);
        if let Some(cached) = self.read_cache(&cache_file) {
            return Some(cached);
        }

        let api_key = self.api_key.as_deref()?;
        if self.calls.get() >= self.budget {
            tracing::warn!(raw_label, budget = self.budget, "oracle budget exhausted");
            return None;
        }
        self.calls.set(self.calls.get() + 1);

        let text = match self.generate(api_key, &build_prompt(raw_label, context)) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(raw_label, error = %err, "oracle call failed");
                return Some(OracleVerdict::non_asset());
            }
        };

        let verdict = match extract_json_object(&text) {
            Some(raw) => enforce_derivable(parse_verdict(&raw), raw_label),
            None => {
                tracing::warn!(raw_label, "oracle returned no JSON object");
                OracleVerdict::non_asset()
            }
        };

        self.write_cache(&cache_file, &verdict);
        Some(verdict)
    }

    fn generate(&self, api_key: &str, prompt: &str) -> Result<String> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            self.model
        );
        let payload = json!({
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": {"temperature": 0, "maxOutputTokens": 512}
        });
        let body: Value = self
            .client
            .post(&url)
            .query(&[("key", api_key)])
            .json(&payload)
            .send()?
            .error_for_status()?
            .json()?;

        let text = body
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| {
                let mut dump = body.to_string();
                dump.truncate(2000);
                dump
            });
        Ok(text)
    }
}
