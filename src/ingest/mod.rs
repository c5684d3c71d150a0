//! Ingestion orchestrators. Each run opens a run row first, does its work,
//! and closes the row ok/error so a crashed run is never invisible.

pub mod trials;

use std::collections::BTreeMap;

use chrono::{Datelike, Utc};
use serde_json::{Map, json};

use crate::config::{CompanyConfig, PipelineSource, Settings, SourceKind};
use crate::diff::diff_sets;
use crate::error::{DossierError, Result};
use crate::evidence;
use crate::extract::html::{self, CuratedAsset};
use crate::extract::pdf;
use crate::extract::PipelineRow;
use crate::http::Fetcher;
use crate::normalize::{norm_text, split_asset_aliases};
use crate::oracle::Oracle;
use crate::sanitize::{self, Classifier};
use crate::store::{ChangeRefs, IndicationFact, RunStatus, Store};

#[derive(Debug, Clone, Default)]
pub struct PipelineSummary {
    pub run_id: i64,
    pub assets_seen: usize,
    pub rows_parsed: usize,
    pub as_of_date: Option<String>,
}

pub fn ingest_pipeline(
    store: &Store,
    settings: &Settings,
    company: &CompanyConfig,
    fetcher: &Fetcher,
    oracle: &Oracle,
) -> Result<PipelineSummary> {
    store.ensure_company(&company.company_id, &company.name)?;
    if let Some(stale) = store.open_run(&company.company_id)? {
        tracing::warn!(company = %company.company_id, run_id = stale, "previous run never finished");
    }
    let run_id = store.start_run(&company.company_id, "pipeline")?;

    match pipeline_run(store, settings, company, fetcher, oracle) {
        Ok(mut summary) => {
            summary.run_id = run_id;
            let notes = format!(
                "assets={} rows={} as_of={}",
                summary.assets_seen,
                summary.rows_parsed,
                summary.as_of_date.as_deref().unwrap_or("-")
            );
            store.finish_run(run_id, RunStatus::Ok, Some(&notes))?;
            Ok(summary)
        }
        Err(err) => {
            // Best effort: the original failure is the one worth reporting.
            let _ = store.finish_run(run_id, RunStatus::Error, Some(&err.to_string()));
            Err(err)
        }
    }
}

fn pipeline_run(
    store: &Store,
    settings: &Settings,
    company: &CompanyConfig,
    fetcher: &Fetcher,
    oracle: &Oracle,
) -> Result<PipelineSummary> {
    if company.pipeline_sources.is_empty() {
        return Err(DossierError::Config(format!(
            "company `{}` has no pipeline sources",
            company.company_id
        )));
    }

    let classifier = Classifier::new(sanitize::Lexicon::with_overlay(&settings.lexicon));
    let mut summary = PipelineSummary::default();

    for source in &company.pipeline_sources {
        match source.kind {
            SourceKind::Pdf | SourceKind::HtmlPdfLink => {
                ingest_pdf_source(store, settings, company, fetcher, oracle, &classifier, source, &mut summary)?;
            }
            SourceKind::HtmlImage | SourceKind::HtmlText => {
                ingest_html_source(store, settings, company, fetcher, &classifier, source, &mut summary)?;
            }
        }
    }

    Ok(summary)
}

/// Discovery fallback chain: explicit override, then a scrape of the source
/// page, then quarterly URL probing, then a hard error.
fn resolve_pdf_url(fetcher: &Fetcher, source: &PipelineSource, max_quarters: u32) -> Result<String> {
    if let Some(url) = &source.override_url {
        return Ok(url.clone());
    }

    if source.kind == SourceKind::Pdf && !source.url.contains('{') {
        return Ok(source.url.clone());
    }

    if source.kind == SourceKind::HtmlPdfLink {
        let page = fetcher.get_text(&source.url)?;
        if let Some(href) = html::find_pdf_url(&page) {
            return Ok(html::absolutize(&source.url, &href));
        }
        tracing::warn!(url = %source.url, "no pipeline PDF link on page, probing quarterly URLs");
    }

    for candidate in quarterly_candidates(&source.url, max_quarters) {
        if fetcher.probe(&candidate) {
            tracing::info!(url = %candidate, "quarterly probe hit");
            return Ok(candidate);
        }
    }

    Err(DossierError::Discovery(format!(
        "could not locate pipeline PDF for source `{}`",
        source.url
    )))
}

/// Candidate URLs from a `{year}`/`{quarter}` template, walking backwards
/// from the current quarter.
fn quarterly_candidates(template: &str, max_quarters: u32) -> Vec<String> {
    if !template.contains("{year}") && !template.contains("{quarter}") {
        return Vec::new();
    }
    let today = Utc::now().date_naive();
    let mut year = today.year();
    let mut quarter = (today.month0() / 3) + 1;

    let mut out = Vec::new();
    for _ in 0..max_quarters {
        out.push(
            template
                .replace("{year}", &year.to_string())
                .replace("{quarter}", &quarter.to_string()),
        );
        if quarter == 1 {
            quarter = 4;
            year -= 1;
        } else {
            quarter -= 1;
        }
    }
    out
}

#[allow(clippy::too_many_arguments)]
fn ingest_pdf_source(
    store: &Store,
    settings: &Settings,
    company: &CompanyConfig,
    fetcher: &Fetcher,
    oracle: &Oracle,
    classifier: &Classifier,
    source: &PipelineSource,
    summary: &mut PipelineSummary,
) -> Result<()> {
    let company_id = company.company_id.as_str();
    let pdf_url = resolve_pdf_url(fetcher, source, settings.probe_max_quarters)?;
    let bytes = fetcher.get_bytes(&pdf_url)?;

    let parsed = pdf::parse_pipeline_pdf(&bytes, classifier)?;
    tracing::info!(
        company = company_id,
        rows = parsed.rows.len(),
        as_of = parsed.as_of_date.as_deref().unwrap_or("-"),
        "parsed pipeline PDF"
    );

    let mut meta = Map::new();
    if let Some(label) = &source.label {
        meta.insert("source_label".to_string(), json!(label));
    }
    let artifact = evidence::store_bytes(
        &settings.evidence_root,
        company_id,
        "pipeline_pdf",
        &pdf_url,
        &bytes,
        Some(meta),
    )?;
    let evidence_id = store.add_evidence(
        company_id,
        "pipeline_pdf",
        &pdf_url,
        &artifact.content_hash,
        &artifact.path.display().to_string(),
        &artifact.meta,
        parsed.as_of_date.as_deref(),
    )?;

    let mut by_asset: BTreeMap<String, Vec<&PipelineRow>> = BTreeMap::new();
    for row in &parsed.rows {
        by_asset.entry(row.asset_label.clone()).or_default().push(row);
    }

    let mut assets_seen = 0usize;
    for (label, rows) in &by_asset {
        let facts: Vec<IndicationFact> = rows
            .iter()
            .filter_map(|row| {
                let indication = classifier.sanitize_indication_text(&row.indication);
                if indication.is_empty() {
                    return None;
                }
                Some(IndicationFact {
                    indication,
                    stage: row.stage.clone(),
                    therapeutic_area: row.therapeutic_area.clone(),
                })
            })
            .collect();
        if facts.is_empty() {
            continue;
        }

        let context = rows
            .iter()
            .map(|r| r.indication.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let Some((canonical, aliases)) =
            resolve_asset_label(store, settings, classifier, oracle, company_id, label, &context)?
        else {
            continue;
        };

        apply_asset_snapshot(
            store,
            company_id,
            evidence_id,
            &canonical,
            &aliases,
            &facts,
            parsed.as_of_date.as_deref(),
            None,
        )?;
        assets_seen += 1;
    }

    store.emit_change(
        company_id,
        "pipeline_ingested",
        json!({
            "as_of_date": parsed.as_of_date,
            "pdf_url": pdf_url,
            "assets_seen": assets_seen,
        }),
        ChangeRefs { evidence_id: Some(evidence_id), ..ChangeRefs::default() },
    )?;

    summary.assets_seen += assets_seen;
    summary.rows_parsed += parsed.rows.len();
    if summary.as_of_date.is_none() {
        summary.as_of_date = parsed.as_of_date;
    }
    Ok(())
}

/// Label to `(canonical, aliases)`. Implausible labels get one oracle
/// consultation; when the oracle is silent or says non-asset, the label is
/// dropped rather than guessed at.
fn resolve_asset_label(
    store: &Store,
    settings: &Settings,
    classifier: &Classifier,
    oracle: &Oracle,
    company_id: &str,
    label: &str,
    context: &str,
) -> Result<Option<(String, Vec<String>)>> {
    if let Some(cleaned) = classifier.sanitize_asset_label(label)
        && classifier.is_plausible_asset_label(&cleaned)
    {
        let (canonical, aliases) = split_asset_aliases(&cleaned);
        return Ok(Some((canonical, aliases)));
    }

    let Some(verdict) = oracle.classify(company_id, label, context) else {
        return Ok(None);
    };
    if !verdict.is_asset {
        return Ok(None);
    }
    let Some(canonical) = verdict.canonical_name else {
        return Ok(None);
    };

    let artifact = evidence::store_json(
        &settings.evidence_root,
        company_id,
        "oracle_asset_clean",
        "oracle://asset-clean",
        &json!({
            "raw_label": label,
            "canonical_name": canonical,
            "aliases": verdict.aliases,
        }),
        None,
    )?;
    store.add_evidence(
        company_id,
        "oracle_asset_clean",
        "oracle://asset-clean",
        &artifact.content_hash,
        &artifact.path.display().to_string(),
        &artifact.meta,
        None,
    )?;

    Ok(Some((canonical, verdict.aliases)))
}

/// Shared per-asset snapshot step: upsert, alias refresh, indication replace
/// bracketed by before/after diffs, and change events for what moved.
#[allow(clippy::too_many_arguments)]
fn apply_asset_snapshot(
    store: &Store,
    company_id: &str,
    evidence_id: i64,
    canonical: &str,
    aliases: &[String],
    facts: &[IndicationFact],
    as_of_date: Option<&str>,
    details: Option<&CuratedAsset>,
) -> Result<i64> {
    let asset = store.upsert_asset(
        company_id,
        canonical,
        details.and_then(|d| d.modality.as_deref()),
        details.and_then(|d| d.target.as_deref()),
        details.map(|d| d.is_disclosed).unwrap_or(true),
    )?;
    for alias in aliases {
        store.ensure_alias(asset.id, alias)?;
    }

    let before = store.latest_indications_before(asset.id, evidence_id)?;
    store.replace_asset_indications(asset.id, evidence_id, facts, as_of_date)?;
    let after = store.current_indications_for_evidence(asset.id, evidence_id)?;
    let (added, removed) = diff_sets(&before, &after);

    let refs = ChangeRefs {
        evidence_id: Some(evidence_id),
        asset_id: Some(asset.id),
        trial_id: None,
    };
    if before.is_empty() && !after.is_empty() {
        store.emit_change(company_id, "asset_added", json!({ "asset": canonical }), refs)?;
    }
    for (indication, stage, area) in &added {
        store.emit_change(
            company_id,
            "asset_indication_added",
            json!({
                "asset": canonical,
                "indication": indication,
                "stage": stage,
                "therapeutic_area": area,
            }),
            refs,
        )?;
    }
    for (indication, stage, area) in &removed {
        store.emit_change(
            company_id,
            "asset_indication_removed",
            json!({
                "asset": canonical,
                "indication": indication,
                "stage": stage,
                "therapeutic_area": area,
            }),
            refs,
        )?;
    }

    Ok(asset.id)
}

/// Image/text pipeline pages: the chart itself cannot be parsed, so curated
/// seeds are authoritative and the page text only contributes aliases.
fn ingest_html_source(
    store: &Store,
    settings: &Settings,
    company: &CompanyConfig,
    fetcher: &Fetcher,
    classifier: &Classifier,
    source: &PipelineSource,
    summary: &mut PipelineSummary,
) -> Result<()> {
    let company_id = company.company_id.as_str();
    let page = fetcher.get_text(&source.url)?;

    let html_artifact = evidence::store_bytes(
        &settings.evidence_root,
        company_id,
        "pipeline_html",
        &source.url,
        page.as_bytes(),
        None,
    )?;
    let html_evidence = store.add_evidence(
        company_id,
        "pipeline_html",
        &source.url,
        &html_artifact.content_hash,
        &html_artifact.path.display().to_string(),
        &html_artifact.meta,
        None,
    )?;

    let mut image_url = None;
    let mut indication_evidence = html_evidence;
    if source.kind == SourceKind::HtmlImage
        && let Some(href) = html::find_pipeline_image_url(&page)
    {
        let url = html::absolutize(&source.url, &href);
        let bytes = fetcher.get_bytes(&url)?;
        let artifact = evidence::store_bytes(
            &settings.evidence_root,
            company_id,
            "pipeline_image",
            &url,
            &bytes,
            None,
        )?;
        indication_evidence = store.add_evidence(
            company_id,
            "pipeline_image",
            &url,
            &artifact.content_hash,
            &artifact.path.display().to_string(),
            &artifact.meta,
            None,
        )?;
        image_url = Some(url);
    }

    let curated = match &company.curated_assets_file {
        Some(path) => html::load_curated_assets(path)?,
        None => Vec::new(),
    };

    let mut assets_seen = 0usize;
    for asset in &curated {
        let (canonical, mut aliases) = split_asset_aliases(&asset.name);
        aliases.extend(asset.aliases.iter().cloned());

        let facts: Vec<IndicationFact> = asset
            .indications
            .iter()
            .map(|ind| IndicationFact {
                indication: ind.indication.clone(),
                stage: ind.stage.clone(),
                therapeutic_area: ind.therapeutic_area.clone(),
            })
            .collect();

        apply_asset_snapshot(
            store,
            company_id,
            indication_evidence,
            &canonical,
            &aliases,
            &facts,
            asset.as_of_date.as_deref(),
            Some(asset),
        )?;
        assets_seen += 1;
    }

    let text = html::page_text(&page);
    let attached = attach_page_aliases(store, classifier, company_id, &text)?;
    if attached > 0 {
        tracing::info!(company = company_id, attached, "aliases picked up from page text");
    }

    store.emit_change(
        company_id,
        "pipeline_ingested",
        json!({
            "pipeline_page": source.url,
            "pipeline_image": image_url,
            "assets_seen": assets_seen,
        }),
        ChangeRefs { evidence_id: Some(indication_evidence), ..ChangeRefs::default() },
    )?;

    summary.assets_seen += assets_seen;
    Ok(())
}

/// Non-destructive alias pickup: program-code tokens in the page text attach
/// to the asset whose existing alias they extend (IMA203CD8 lands on the
/// asset already known as IMA203).
fn attach_page_aliases(
    store: &Store,
    classifier: &Classifier,
    company_id: &str,
    text: &str,
) -> Result<usize> {
    let index = store.alias_index(company_id)?;
    if index.is_empty() {
        return Ok(0);
    }

    let mut attached = 0usize;
    for token in text.split_whitespace() {
        let token = token.trim_matches([',', '.', ';', ':', '(', ')']);
        if !sanitize::is_program_code(token) {
            continue;
        }
        let Some(cleaned) = classifier.sanitize_alias(token) else {
            continue;
        };
        let token_norm = norm_text(&cleaned);

        // Longest known alias contained in the token wins.
        let target = index
            .iter()
            .filter(|(alias_norm, _)| token_norm.contains(alias_norm.as_str()))
            .max_by_key(|(alias_norm, _)| alias_norm.len());
        if let Some((_, asset_id)) = target {
            store.ensure_alias(*asset_id, &cleaned)?;
            attached += 1;
        }
    }
    Ok(attached)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quarterly_candidates_walk_backwards() {
        let candidates = quarterly_candidates(
            "https://cdn.example.com/Pipeline-Q{quarter}-{year}.pdf",
            3,
        );
        assert_eq!(candidates.len(), 3);
        for candidate in &candidates {
            assert!(!candidate.contains('{'), "unexpanded template: {candidate}");
        }
        assert_ne!(candidates[0], candidates[1]);
        assert_ne!(candidates[1], candidates[2]);
    }

    #[test]
    fn plain_urls_produce_no_candidates() {
        assert!(quarterly_candidates("https://example.com/pipeline.pdf", 8).is_empty());
    }

    #[test]
    fn snapshot_diff_emits_added_then_removed_events() {
        let store = Store::open_in_memory().expect("store");
        store.ensure_company("jnj", "Johnson & Johnson").expect("company");
        let ev1 = store
            .add_evidence("jnj", "pipeline_pdf", "https://x/1.pdf", "h1", "/tmp/1", &json!({}), None)
            .expect("evidence");

        let facts = vec![IndicationFact {
            indication: "NSCLC".to_string(),
            stage: "Phase 2".to_string(),
            therapeutic_area: Some("Oncology".to_string()),
        }];
        apply_asset_snapshot(&store, "jnj", ev1, "JNJ-1900", &["NBTXR3".to_string()], &facts, None, None)
            .expect("snapshot");

        let events = store.recent_events("jnj", 10).expect("events");
        let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).rev().collect();
        assert_eq!(kinds, vec!["asset_added", "asset_indication_added"]);

        // Second snapshot moves the program to Phase 3.
        let ev2 = store
            .add_evidence("jnj", "pipeline_pdf", "https://x/2.pdf", "h2", "/tmp/2", &json!({}), None)
            .expect("evidence");
        let moved = vec![IndicationFact {
            indication: "NSCLC".to_string(),
            stage: "Phase 3".to_string(),
            therapeutic_area: Some("Oncology".to_string()),
        }];
        apply_asset_snapshot(&store, "jnj", ev2, "JNJ-1900", &[], &moved, None, None)
            .expect("snapshot");

        let events = store.recent_events("jnj", 10).expect("events");
        assert_eq!(events[0].event_type, "asset_indication_removed");
        assert_eq!(events[1].event_type, "asset_indication_added");
        assert_eq!(events[1].payload["stage"], json!("Phase 3"));
    }

    #[test]
    fn identical_snapshot_is_silent() {
        let store = Store::open_in_memory().expect("store");
        store.ensure_company("jnj", "Johnson & Johnson").expect("company");
        let facts = vec![IndicationFact {
            indication: "NSCLC".to_string(),
            stage: "Phase 2".to_string(),
            therapeutic_area: None,
        }];
        let ev1 = store
            .add_evidence("jnj", "pipeline_pdf", "https://x/1.pdf", "h1", "/tmp/1", &json!({}), None)
            .expect("evidence");
        apply_asset_snapshot(&store, "jnj", ev1, "JNJ-1900", &[], &facts, None, None).expect("snapshot");
        let baseline = store.count_events("jnj").expect("count");

        let ev2 = store
            .add_evidence("jnj", "pipeline_pdf", "https://x/2.pdf", "h2", "/tmp/2", &json!({}), None)
            .expect("evidence");
        apply_asset_snapshot(&store, "jnj", ev2, "JNJ-1900", &[], &facts, None, None).expect("snapshot");
        assert_eq!(store.count_events("jnj").expect("count"), baseline);
    }

    #[test]
    fn page_tokens_attach_to_the_longest_matching_alias() {
        let store = Store::open_in_memory().expect("store");
        store.ensure_company("immatics", "Immatics").expect("company");
        let asset = store
            .upsert_asset("immatics", "anzu-cel", None, None, true)
            .expect("asset");
        store.ensure_alias(asset.id, "IMA203").expect("alias");

        let classifier = Classifier::new(sanitize::Lexicon::default());
        let attached = attach_page_aliases(
            &store,
            &classifier,
            "immatics",
            "Our lead candidate IMA203CD8 builds on IMA203.",
        )
        .expect("attach");
        assert!(attached >= 1);

        let aliases = store.aliases_for_asset(asset.id).expect("aliases");
        assert!(aliases.iter().any(|(_, alias, _)| alias == "IMA203CD8"));
    }
}
