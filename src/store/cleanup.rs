//! Batch maintenance: safe merge of duplicate assets and per-company
//! re-sanitization. Not part of the hot ingestion path.

use std::collections::HashSet;

use rusqlite::{OptionalExtension, params};

use crate::normalize::norm_text;
use crate::sanitize::Classifier;
use crate::store::Store;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub assets_seen: usize,
    pub hidden: usize,
    pub renamed: usize,
    pub merged: usize,
    pub aliases_dropped: usize,
}

impl Store {
    /// Fold `src` into `dst` and delete `src`. Runs in one transaction:
    /// either the whole merge lands or none of it does.
    pub fn merge_assets(&self, src_id: i64, dst_id: i64) -> rusqlite::Result<()> {
        let tx = self.connection().unchecked_transaction()?;

        tx.execute(
            "UPDATE asset_indications SET asset_id = ?1 WHERE asset_id = ?2",
            params![dst_id, src_id],
        )?;

        // Aliases: move unless the normalized form already exists on dst.
        let mut existing_norms: HashSet<String> = {
            let mut stmt =
                tx.prepare("SELECT alias_norm FROM asset_aliases WHERE asset_id = ?1")?;
            let rows = stmt.query_map(params![dst_id], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        let src_aliases: Vec<(i64, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, alias_norm FROM asset_aliases WHERE asset_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![src_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for (alias_id, alias_norm) in src_aliases {
            if existing_norms.contains(&alias_norm) {
                tx.execute("DELETE FROM asset_aliases WHERE id = ?1", params![alias_id])?;
            } else {
                tx.execute(
                    "UPDATE asset_aliases SET asset_id = ?1 WHERE id = ?2",
                    params![dst_id, alias_id],
                )?;
                existing_norms.insert(alias_norm);
            }
        }

        // Trial links: move unless (trial, dst) already exists.
        let src_links: Vec<(i64, i64)> = {
            let mut stmt = tx.prepare(
                "SELECT id, trial_id FROM trial_asset_links WHERE asset_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![src_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for (link_id, trial_id) in src_links {
            let collides: Option<i64> = tx
                .query_row(
                    "SELECT id FROM trial_asset_links WHERE trial_id = ?1 AND asset_id = ?2",
                    params![trial_id, dst_id],
                    |row| row.get(0),
                )
                .optional()?;
            if collides.is_some() {
                tx.execute("DELETE FROM trial_asset_links WHERE id = ?1", params![link_id])?;
            } else {
                tx.execute(
                    "UPDATE trial_asset_links SET asset_id = ?1 WHERE id = ?2",
                    params![dst_id, link_id],
                )?;
            }
        }

        tx.execute(
            "UPDATE change_events SET asset_id = ?1 WHERE asset_id = ?2",
            params![dst_id, src_id],
        )?;
        tx.execute("DELETE FROM assets WHERE id = ?1", params![src_id])?;

        tx.commit()
    }

    /// Re-sanitize every asset of a company: hide the implausible ones
    /// (history is preserved, reports skip them), merge name collisions,
    /// and rebuild each surviving alias set from scratch.
    pub fn clean_company(
        &self,
        classifier: &Classifier,
        company_id: &str,
    ) -> rusqlite::Result<CleanupStats> {
        let mut stats = CleanupStats::default();

        for asset in self.assets_for_company(company_id)? {
            // The asset may have been merged away earlier in this pass.
            let Some(asset) = self.asset_by_id(asset.id)? else {
                continue;
            };
            stats.assets_seen += 1;

            let raw = asset.canonical_name.clone();
            let cleaned = classifier
                .sanitize_asset_label(&raw)
                .unwrap_or_else(|| raw.clone());

            if !classifier.is_plausible_asset_label(&cleaned) {
                if asset.is_disclosed {
                    self.connection().execute(
                        "UPDATE assets SET is_disclosed = 0 WHERE id = ?1",
                        params![asset.id],
                    )?;
                    stats.hidden += 1;
                }
                continue;
            }

            let mut asset_id = asset.id;
            if cleaned != raw {
                match self.find_asset_by_name(company_id, &cleaned)? {
                    Some(existing) if existing.id != asset.id => {
                        self.merge_assets(asset.id, existing.id)?;
                        stats.merged += 1;
                        asset_id = existing.id;
                    }
                    _ => {
                        self.connection().execute(
                            "UPDATE assets SET canonical_name = ?1 WHERE id = ?2",
                            params![cleaned, asset.id],
                        )?;
                        stats.renamed += 1;
                    }
                }
            }

            // Rebuild the alias set: sanitize, dedupe by normalized form
            // (first-seen alias wins), then replace the rows atomically.
            let mut seen: HashSet<String> = HashSet::new();
            let mut rebuilt: Vec<(String, String)> = Vec::new();
            for (_, alias, _) in self.aliases_for_asset(asset_id)? {
                let Some(clean_alias) = classifier.sanitize_alias(&alias) else {
                    stats.aliases_dropped += 1;
                    continue;
                };
                if !classifier.is_plausible_asset_label(&clean_alias) {
                    stats.aliases_dropped += 1;
                    continue;
                }
                let alias_norm = norm_text(&clean_alias);
                if alias_norm.is_empty() || !seen.insert(alias_norm.clone()) {
                    stats.aliases_dropped += 1;
                    continue;
                }
                rebuilt.push((clean_alias, alias_norm));
            }
            self.replace_aliases(asset_id, &rebuilt)?;
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IndicationFact, MatchKind, ResolvedLink, TrialCore};
    use serde_json::json;

    fn seeded() -> Store {
        let store = Store::open_in_memory().expect("store");
        store.ensure_company("jnj", "Johnson & Johnson").expect("company");
        store
    }

    fn evidence(store: &Store) -> i64 {
        store
            .add_evidence("jnj", "pipeline_pdf", "https://x/p.pdf", "cafe", "/tmp/p.pdf", &json!({}), None)
            .expect("evidence")
    }

    #[test]
    fn merge_moves_children_and_deletes_source() {
        let store = seeded();
        let ev = evidence(&store);

        let a = store.upsert_asset("jnj", "TAR-200 ", None, None, true).expect("a");
        let b = store.upsert_asset("jnj", "TAR-200", None, None, true).expect("b");

        store.ensure_alias(a.id, "TAR-200").expect("alias a");
        store.ensure_alias(b.id, "tar-200").expect("conflicting alias b");

        let facts = vec![
            IndicationFact {
                indication: "NMIBC".to_string(),
                stage: "Phase 2".to_string(),
                therapeutic_area: None,
            },
            IndicationFact {
                indication: "MIBC".to_string(),
                stage: "Phase 3".to_string(),
                therapeutic_area: None,
            },
        ];
        store
            .replace_asset_indications(a.id, ev, &facts, None)
            .expect("indications on src");

        let trial = store
            .upsert_trial(
                "jnj",
                &TrialCore {
                    registry_id: "NCT00000042".to_string(),
                    source_url: "https://registry/NCT00000042".to_string(),
                    ..TrialCore::default()
                },
                ev,
            )
            .expect("trial");
        store
            .replace_trial_links(
                trial.trial_id,
                &[ResolvedLink {
                    asset_id: a.id,
                    kind: MatchKind::Exact,
                    score: 100,
                }],
            )
            .expect("link on src");

        store.merge_assets(a.id, b.id).expect("merge");

        assert!(store.asset_by_id(a.id).expect("src gone").is_none());
        assert_eq!(store.count_indications(b.id).expect("ind count"), 2);
        assert_eq!(store.aliases_for_asset(b.id).expect("aliases").len(), 1);
        let links = store.links_for_trial(trial.trial_id).expect("links");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].asset_id, b.id);
    }

    #[test]
    fn merge_drops_colliding_trial_links() {
        let store = seeded();
        let ev = evidence(&store);
        let a = store.upsert_asset("jnj", "A", None, None, true).expect("a");
        let b = store.upsert_asset("jnj", "B", None, None, true).expect("b");
        let trial = store
            .upsert_trial(
                "jnj",
                &TrialCore {
                    registry_id: "NCT00000043".to_string(),
                    source_url: "https://registry/NCT00000043".to_string(),
                    ..TrialCore::default()
                },
                ev,
            )
            .expect("trial");
        store
            .replace_trial_links(
                trial.trial_id,
                &[
                    ResolvedLink { asset_id: a.id, kind: MatchKind::Fuzzy, score: 93 },
                    ResolvedLink { asset_id: b.id, kind: MatchKind::Exact, score: 100 },
                ],
            )
            .expect("links");

        store.merge_assets(a.id, b.id).expect("merge");
        let links = store.links_for_trial(trial.trial_id).expect("links");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].asset_id, b.id);
    }

    #[test]
    fn cleanup_hides_implausible_assets_instead_of_deleting() {
        let store = seeded();
        let classifier = Classifier::default();
        let bad = store
            .upsert_asset("jnj", "Hemolytic Anemia", None, None, true)
            .expect("bad asset");

        let stats = store.clean_company(&classifier, "jnj").expect("cleanup");
        assert_eq!(stats.hidden, 1);
        let row = store.asset_by_id(bad.id).expect("still there").expect("row");
        assert!(!row.is_disclosed);
    }

    #[test]
    fn cleanup_rebuilds_aliases_without_uniqueness_violation() {
        let store = seeded();
        let classifier = Classifier::default();
        let asset = store.upsert_asset("jnj", "JNJ-1900", None, None, true).expect("asset");
        // Distinct stored norms that sanitize to the same normalized value:
        // the letter-spaced OCR form collapses back to NBTXR3.
        store.ensure_alias(asset.id, "NBTXR3").expect("alias 1");
        store.ensure_alias(asset.id, "N B T X R 3").expect("alias 2");
        store.ensure_alias(asset.id, "Indications").expect("garbage alias");

        let stats = store.clean_company(&classifier, "jnj").expect("cleanup");
        let aliases = store.aliases_for_asset(asset.id).expect("aliases");
        assert_eq!(aliases.len(), 1);
        assert_eq!(aliases[0].1, "NBTXR3");
        assert_eq!(stats.aliases_dropped, 2);
    }

    #[test]
    fn cleanup_merges_on_cleaned_name_collision() {
        let store = seeded();
        let classifier = Classifier::default();
        let ev = evidence(&store);
        let keeper = store.upsert_asset("jnj", "TAR-200", None, None, true).expect("keeper");
        let dupe = store
            .upsert_asset("jnj", "\u{2022} TAR-200", None, None, true)
            .expect("dupe");
        store
            .replace_asset_indications(
                dupe.id,
                ev,
                &[IndicationFact {
                    indication: "NMIBC".to_string(),
                    stage: "Phase 3".to_string(),
                    therapeutic_area: None,
                }],
                None,
            )
            .expect("indication");

        let stats = store.clean_company(&classifier, "jnj").expect("cleanup");
        assert_eq!(stats.merged, 1);
        assert!(store.asset_by_id(dupe.id).expect("gone").is_none());
        assert_eq!(store.count_indications(keeper.id).expect("count"), 1);
    }
}
