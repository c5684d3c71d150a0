//! Registry ingestion: query the trial registry by alias, keep studies the
//! company sponsors, upsert them, and rebuild asset links.

use std::collections::HashSet;

use serde_json::json;

use crate::config::{CompanyConfig, Settings};
use crate::error::Result;
use crate::evidence;
use crate::http::Fetcher;
use crate::link::{BootstrapTracker, Intervention, Linker, candidate_terms};
use crate::registry::{self, RegistryClient, STUDIES_ENDPOINT};
use crate::sanitize::Lexicon;
use crate::store::{ChangeRefs, RunStatus, Store};

#[derive(Debug, Clone, Default)]
pub struct TrialsSummary {
    pub run_id: i64,
    pub trials_seen: usize,
    pub inserted: usize,
    pub updated: usize,
    pub status_changed: usize,
    pub bad_aliases: usize,
    pub bootstrapped: usize,
}

pub fn ingest_trials(
    store: &Store,
    settings: &Settings,
    company: &CompanyConfig,
    fetcher: &Fetcher,
) -> Result<TrialsSummary> {
    store.ensure_company(&company.company_id, &company.name)?;
    if let Some(stale) = store.open_run(&company.company_id)? {
        tracing::warn!(company = %company.company_id, run_id = stale, "previous run never finished");
    }
    let run_id = store.start_run(&company.company_id, "trials")?;

    match trials_run(store, settings, company, fetcher) {
        Ok(mut summary) => {
            summary.run_id = run_id;
            let notes = format!(
                "seen={} inserted={} updated={} bad_aliases={}",
                summary.trials_seen, summary.inserted, summary.updated, summary.bad_aliases
            );
            store.finish_run(run_id, RunStatus::Ok, Some(&notes))?;
            Ok(summary)
        }
        Err(err) => {
            let _ = store.finish_run(run_id, RunStatus::Error, Some(&err.to_string()));
            Err(err)
        }
    }
}

fn trials_run(
    store: &Store,
    settings: &Settings,
    company: &CompanyConfig,
    fetcher: &Fetcher,
) -> Result<TrialsSummary> {
    let company_id = company.company_id.as_str();
    let lexicon = Lexicon::with_overlay(&settings.lexicon);
    let client = RegistryClient::new(
        fetcher,
        settings.registry_page_size,
        settings.registry_max_pages_per_query,
        &settings.registry_statuses,
    );

    let terms = registry::query_alias_terms(
        &store.alias_terms(company_id)?,
        settings.min_alias_len_for_trial_search,
    );
    tracing::info!(company = company_id, terms = terms.len(), "querying registry alias terms");

    let mut summary = TrialsSummary::default();
    let mut seen_ids: HashSet<String> = HashSet::new();

    for term in &terms {
        let search = client.search_intervention(term)?;
        if search.rejected {
            summary.bad_aliases += 1;
            continue;
        }

        // Index rebuilt per term so bootstrapped aliases take effect on the
        // next one.
        let linker = Linker::new(store.alias_index(company_id)?, &lexicon, settings.fuzzy_threshold);
        let mut tracker = BootstrapTracker::default();

        for record in &search.records {
            let study = &record.study;
            let Some(registry_id) = study.nct_id().map(ToOwned::to_owned) else {
                continue;
            };
            if seen_ids.contains(&registry_id) || !study.belongs_to(&company.trial_sponsor_aliases) {
                continue;
            }
            seen_ids.insert(registry_id.clone());

            let source_marker = format!("{STUDIES_ENDPOINT}?nct={registry_id}");
            let mut meta = serde_json::Map::new();
            meta.insert("query_term".to_string(), json!(term));
            let artifact = evidence::store_json(
                &settings.evidence_root,
                company_id,
                "registry_study_json",
                &source_marker,
                &record.raw,
                Some(meta),
            )?;
            let evidence_id = store.add_evidence(
                company_id,
                "registry_study_json",
                &source_marker,
                &artifact.content_hash,
                &artifact.path.display().to_string(),
                &artifact.meta,
                None,
            )?;

            let Some(core) = study.core() else {
                continue;
            };
            let upsert = store.upsert_trial(company_id, &core, evidence_id)?;
            let refs = ChangeRefs {
                evidence_id: Some(evidence_id),
                asset_id: None,
                trial_id: Some(upsert.trial_id),
            };

            if upsert.created {
                summary.inserted += 1;
                store.emit_change(
                    company_id,
                    "trial_added",
                    json!({ "registry_id": registry_id, "title": core.title }),
                    refs,
                )?;
            } else {
                summary.updated += 1;
            }
            if let Some((from, to)) = &upsert.status_changed {
                summary.status_changed += 1;
                store.emit_change(
                    company_id,
                    "trial_status_changed",
                    json!({ "registry_id": registry_id, "from": from, "to": to }),
                    refs,
                )?;
            }

            let interventions = study.interventions();
            let children: Vec<(String, Option<String>)> = interventions
                .iter()
                .map(|iv| (iv.name.clone(), iv.kind.clone()))
                .collect();
            store.replace_trial_children(upsert.trial_id, &children, study.conditions())?;

            let linked = link_trial(store, &linker, upsert.trial_id, &interventions)?;
            if linked > 0 {
                store.emit_change(
                    company_id,
                    "trial_assets_linked",
                    json!({ "registry_id": registry_id, "linked_assets": linked }),
                    refs,
                )?;
            }

            for intervention in &interventions {
                for candidate in candidate_terms(intervention, &lexicon) {
                    tracker.observe(&candidate, upsert.trial_id);
                }
            }
        }

        summary.bootstrapped += promote_bootstrap_aliases(
            store,
            company_id,
            &linker,
            &tracker,
            term,
            settings.bootstrap_min_trials,
            &lexicon,
        )?;
    }

    summary.trials_seen = seen_ids.len();
    store.emit_change(
        company_id,
        "trials_ingested",
        json!({
            "trials_seen": summary.trials_seen,
            "inserted": summary.inserted,
            "updated": summary.updated,
            "status_changed": summary.status_changed,
            "bad_aliases": summary.bad_aliases,
            "bootstrapped": summary.bootstrapped,
        }),
        ChangeRefs::default(),
    )?;
    Ok(summary)
}

/// Rebuild the trial's link set from its interventions. Idempotent by
/// construction: the set is a pure function of interventions and the index.
fn link_trial(
    store: &Store,
    linker: &Linker<'_>,
    trial_id: i64,
    interventions: &[Intervention],
) -> Result<usize> {
    let links = linker.resolve(interventions);
    store.replace_trial_links(trial_id, &links)?;
    Ok(links.len())
}

/// Promote recurring drug-like intervention terms onto the asset the query
/// term belongs to. Terms that already resolve somewhere are left alone.
fn promote_bootstrap_aliases(
    store: &Store,
    company_id: &str,
    linker: &Linker<'_>,
    tracker: &BootstrapTracker,
    query_term: &str,
    min_trials: usize,
    lexicon: &Lexicon,
) -> Result<usize> {
    let Some((asset_id, _, _)) = linker.match_term(query_term) else {
        return Ok(0);
    };

    let mut promoted = 0usize;
    for term in tracker.promotable(min_trials, lexicon) {
        if linker.match_term(&term).is_some() {
            continue;
        }
        store.ensure_alias(asset_id, &term)?;
        store.emit_change(
            company_id,
            "trial_alias_bootstrapped",
            json!({ "alias": term, "from_query": query_term }),
            ChangeRefs { asset_id: Some(asset_id), ..ChangeRefs::default() },
        )?;
        promoted += 1;
    }
    Ok(promoted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MatchKind, TrialCore};

    fn seeded() -> (Store, i64) {
        let store = Store::open_in_memory().expect("store");
        store.ensure_company("jnj", "Johnson & Johnson").expect("company");
        let asset = store
            .upsert_asset("jnj", "RYBREVANT", None, None, true)
            .expect("asset");
        store.ensure_alias(asset.id, "amivantamab").expect("alias");
        store.ensure_alias(asset.id, "RYBREVANT").expect("alias");
        (store, asset.id)
    }

    fn trial(store: &Store, registry_id: &str) -> i64 {
        let evidence_id = store
            .add_evidence("jnj", "registry_study_json", "https://x", "h", "/tmp/x", &json!({}), None)
            .expect("evidence");
        let core = TrialCore {
            registry_id: registry_id.to_string(),
            source_url: format!("https://clinicaltrials.gov/study/{registry_id}"),
            ..TrialCore::default()
        };
        store.upsert_trial("jnj", &core, evidence_id).expect("trial").trial_id
    }

    #[test]
    fn relinking_is_idempotent() {
        let (store, asset_id) = seeded();
        let lexicon = Lexicon::default();
        let trial_id = trial(&store, "NCT00000001");
        let linker = Linker::new(store.alias_index("jnj").expect("index"), &lexicon, 92);

        let interventions = vec![Intervention {
            name: "Amivantamab (RYBREVANT)".to_string(),
            kind: Some("DRUG".to_string()),
            other_names: vec![],
        }];
        let first = link_trial(&store, &linker, trial_id, &interventions).expect("link");
        let second = link_trial(&store, &linker, trial_id, &interventions).expect("relink");
        assert_eq!(first, 1);
        assert_eq!(second, 1);

        let links = store.links_for_trial(trial_id).expect("links");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].asset_id, asset_id);
        assert_eq!(links[0].kind, MatchKind::Exact);
    }

    #[test]
    fn bootstrap_needs_two_distinct_trials() {
        let (store, asset_id) = seeded();
        let lexicon = Lexicon::default();
        let linker = Linker::new(store.alias_index("jnj").expect("index"), &lexicon, 92);

        let t1 = trial(&store, "NCT00000001");
        let t2 = trial(&store, "NCT00000002");

        let mut tracker = BootstrapTracker::default();
        tracker.observe("lazertinib", t1);
        let promoted = promote_bootstrap_aliases(
            &store, "jnj", &linker, &tracker, "amivantamab", 2, &lexicon,
        )
        .expect("promote");
        assert_eq!(promoted, 0);

        tracker.observe("lazertinib", t2);
        let promoted = promote_bootstrap_aliases(
            &store, "jnj", &linker, &tracker, "amivantamab", 2, &lexicon,
        )
        .expect("promote");
        assert_eq!(promoted, 1);

        let aliases = store.aliases_for_asset(asset_id).expect("aliases");
        assert!(aliases.iter().any(|(_, alias, _)| alias == "lazertinib"));

        let events = store.recent_events("jnj", 5).expect("events");
        assert_eq!(events[0].event_type, "trial_alias_bootstrapped");
    }

    #[test]
    fn known_terms_are_never_re_promoted() {
        let (store, _) = seeded();
        let lexicon = Lexicon::default();
        let linker = Linker::new(store.alias_index("jnj").expect("index"), &lexicon, 92);
        let t1 = trial(&store, "NCT00000001");
        let t2 = trial(&store, "NCT00000002");

        let mut tracker = BootstrapTracker::default();
        tracker.observe("RYBREVANT", t1);
        tracker.observe("RYBREVANT", t2);
        let promoted = promote_bootstrap_aliases(
            &store, "jnj", &linker, &tracker, "amivantamab", 2, &lexicon,
        )
        .expect("promote");
        assert_eq!(promoted, 0);
    }

    #[test]
    fn brand_names_bootstrap_when_fed_through_candidate_terms() {
        let (store, asset_id) = seeded();
        let lexicon = Lexicon::default();
        let linker = Linker::new(store.alias_index("jnj").expect("index"), &lexicon, 92);
        let t1 = trial(&store, "NCT00000001");
        let t2 = trial(&store, "NCT00000002");

        // Same shape as the ingest loop: raw intervention strings, not
        // pre-cleaned terms.
        let mut tracker = BootstrapTracker::default();
        for (trial_id, name) in [(t1, "LAZCLUZE 240 mg"), (t2, "LAZCLUZE tablets")] {
            let iv = Intervention {
                name: name.to_string(),
                kind: Some("DRUG".to_string()),
                ..Intervention::default()
            };
            for term in candidate_terms(&iv, &lexicon) {
                tracker.observe(&term, trial_id);
            }
        }

        let promoted = promote_bootstrap_aliases(
            &store, "jnj", &linker, &tracker, "amivantamab", 2, &lexicon,
        )
        .expect("promote");
        assert_eq!(promoted, 1);

        let aliases = store.aliases_for_asset(asset_id).expect("aliases");
        assert!(aliases.iter().any(|(_, alias, _)| alias == "LAZCLUZE"));
    }

    #[test]
    fn unresolvable_query_term_promotes_nothing() {
        let (store, _) = seeded();
        let lexicon = Lexicon::default();
        let linker = Linker::new(Vec::new(), &lexicon, 92);
        let t1 = trial(&store, "NCT00000001");
        let t2 = trial(&store, "NCT00000002");

        let mut tracker = BootstrapTracker::default();
        tracker.observe("lazertinib", t1);
        tracker.observe("lazertinib", t2);
        let promoted = promote_bootstrap_aliases(
            &store, "jnj", &linker, &tracker, "somethingelse", 2, &lexicon,
        )
        .expect("promote");
        assert_eq!(promoted, 0);
    }
}
