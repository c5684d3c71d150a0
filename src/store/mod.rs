pub mod cleanup;

use std::collections::BTreeSet;
use std::path::Path;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use crate::normalize::norm_text;

/// One (indication, stage, therapeutic area) fact key used by snapshot diffs.
pub type IndKey = (String, String, Option<String>);

#[derive(Debug, Clone, PartialEq)]
pub struct AssetRow {
    pub id: i64,
    pub company_id: String,
    pub canonical_name: String,
    pub modality: Option<String>,
    pub target: Option<String>,
    pub is_disclosed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndicationFact {
    pub indication: String,
    pub stage: String,
    pub therapeutic_area: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TrialCore {
    pub registry_id: String,
    pub title: Option<String>,
    pub overall_status: Option<String>,
    pub phase: Option<String>,
    pub start_date: Option<String>,
    pub last_update_posted: Option<String>,
    pub lead_sponsor: Option<String>,
    pub collaborators: Vec<String>,
    pub source_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrialUpsert {
    pub trial_id: i64,
    pub created: bool,
    /// `(old, new)` when the registry status actually changed.
    pub status_changed: Option<(Option<String>, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Fuzzy,
}

impl MatchKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Fuzzy => "fuzzy",
        }
    }

    /// Exact beats fuzzy when resolving one winner per asset.
    pub const fn rank(self) -> u8 {
        match self {
            Self::Exact => 2,
            Self::Fuzzy => 1,
        }
    }
}

fn decode_match_kind(raw: &str) -> MatchKind {
    match raw {
        "exact" => MatchKind::Exact,
        _ => MatchKind::Fuzzy,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedLink {
    pub asset_id: i64,
    pub kind: MatchKind,
    pub score: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Ok,
    Error,
}

impl RunStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

/// Optional row references attached to a change event.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeRefs {
    pub evidence_id: Option<i64>,
    pub asset_id: Option<i64>,
    pub trial_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct RunRow {
    pub id: i64,
    pub company_id: String,
    pub run_type: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChangeEventRow {
    pub id: i64,
    pub company_id: String,
    pub event_type: String,
    pub occurred_at: String,
    pub payload: Value,
    pub evidence_id: Option<i64>,
    pub asset_id: Option<i64>,
    pub trial_id: Option<i64>,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;

            CREATE TABLE IF NOT EXISTS companies (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS evidence (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                company_id TEXT NOT NULL REFERENCES companies(id),
                evidence_type TEXT NOT NULL,
                source_url TEXT NOT NULL,
                fetched_at TEXT NOT NULL,
                published_at TEXT,
                content_hash TEXT NOT NULL,
                content_path TEXT NOT NULL,
                meta TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_evidence_company ON evidence(company_id);
            CREATE INDEX IF NOT EXISTS idx_evidence_hash ON evidence(content_hash);

            CREATE TABLE IF NOT EXISTS assets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                company_id TEXT NOT NULL REFERENCES companies(id),
                canonical_name TEXT NOT NULL,
                modality TEXT,
                target TEXT,
                is_disclosed INTEGER NOT NULL DEFAULT 1 CHECK (is_disclosed IN (0, 1)),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(company_id, canonical_name)
            );
            CREATE INDEX IF NOT EXISTS idx_assets_company ON assets(company_id);

            CREATE TABLE IF NOT EXISTS asset_aliases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                asset_id INTEGER NOT NULL REFERENCES assets(id),
                alias TEXT NOT NULL,
                alias_norm TEXT NOT NULL,
                UNIQUE(asset_id, alias_norm)
            );
            CREATE INDEX IF NOT EXISTS idx_alias_norm ON asset_aliases(alias_norm);

            CREATE TABLE IF NOT EXISTS asset_indications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                asset_id INTEGER NOT NULL REFERENCES assets(id),
                indication TEXT NOT NULL,
                stage TEXT NOT NULL,
                therapeutic_area TEXT,
                as_of_date TEXT,
                evidence_id INTEGER NOT NULL REFERENCES evidence(id)
            );
            CREATE INDEX IF NOT EXISTS idx_indication_asset ON asset_indications(asset_id);

            CREATE TABLE IF NOT EXISTS trials (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                company_id TEXT NOT NULL REFERENCES companies(id),
                registry_id TEXT NOT NULL,
                title TEXT,
                overall_status TEXT,
                phase TEXT,
                start_date TEXT,
                last_update_posted TEXT,
                lead_sponsor TEXT,
                collaborators TEXT NOT NULL DEFAULT '[]',
                source_url TEXT NOT NULL,
                fetched_at TEXT NOT NULL,
                evidence_id INTEGER NOT NULL REFERENCES evidence(id),
                UNIQUE(company_id, registry_id)
            );
            CREATE INDEX IF NOT EXISTS idx_trial_status ON trials(overall_status);

            CREATE TABLE IF NOT EXISTS trial_interventions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trial_id INTEGER NOT NULL REFERENCES trials(id),
                name TEXT NOT NULL,
                intervention_type TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_intervention_trial ON trial_interventions(trial_id);

            CREATE TABLE IF NOT EXISTS trial_conditions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trial_id INTEGER NOT NULL REFERENCES trials(id),
                condition TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_condition_trial ON trial_conditions(trial_id);

            CREATE TABLE IF NOT EXISTS trial_asset_links (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trial_id INTEGER NOT NULL REFERENCES trials(id),
                asset_id INTEGER NOT NULL REFERENCES assets(id),
                match_type TEXT NOT NULL,
                match_score INTEGER NOT NULL,
                UNIQUE(trial_id, asset_id)
            );

            CREATE TABLE IF NOT EXISTS change_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                company_id TEXT NOT NULL REFERENCES companies(id),
                event_type TEXT NOT NULL,
                occurred_at TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}',
                evidence_id INTEGER REFERENCES evidence(id),
                asset_id INTEGER,
                trial_id INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_change_company_time
                ON change_events(company_id, occurred_at);

            CREATE TABLE IF NOT EXISTS ingestion_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                company_id TEXT NOT NULL REFERENCES companies(id),
                run_type TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                status TEXT NOT NULL DEFAULT 'running',
                notes TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_runs_company_type
                ON ingestion_runs(company_id, run_type);
            ",
        )
    }

    fn now() -> String {
        Utc::now().to_rfc3339()
    }

    pub fn ensure_company(&self, company_id: &str, name: &str) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO companies (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![company_id, name, Self::now()],
        )?;
        Ok(())
    }

    pub fn add_evidence(
        &self,
        company_id: &str,
        evidence_type: &str,
        source_url: &str,
        content_hash: &str,
        content_path: &str,
        meta: &Value,
        published_at: Option<&str>,
    ) -> rusqlite::Result<i64> {
        self.conn.execute(
            "INSERT INTO evidence (
                company_id, evidence_type, source_url, fetched_at, published_at,
                content_hash, content_path, meta
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                company_id,
                evidence_type,
                source_url,
                Self::now(),
                published_at,
                content_hash,
                content_path,
                meta.to_string()
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Idempotent: looks up by (company, canonical name), creates if absent,
    /// updates only fields that actually changed.
    pub fn upsert_asset(
        &self,
        company_id: &str,
        canonical_name: &str,
        modality: Option<&str>,
        target: Option<&str>,
        is_disclosed: bool,
    ) -> rusqlite::Result<AssetRow> {
        if let Some(existing) = self.find_asset_by_name(company_id, canonical_name)? {
            let mut changed = false;
            let mut next = existing.clone();
            if let Some(modality) = modality
                && existing.modality.as_deref() != Some(modality)
            {
                next.modality = Some(modality.to_string());
                changed = true;
            }
            if let Some(target) = target
                && existing.target.as_deref() != Some(target)
            {
                next.target = Some(target.to_string());
                changed = true;
            }
            if existing.is_disclosed != is_disclosed {
                next.is_disclosed = is_disclosed;
                changed = true;
            }
            if changed {
                self.conn.execute(
                    "UPDATE assets SET modality = ?1, target = ?2, is_disclosed = ?3, updated_at = ?4
                     WHERE id = ?5",
                    params![next.modality, next.target, next.is_disclosed as i64, Self::now(), next.id],
                )?;
            }
            return Ok(next);
        }

        self.conn.execute(
            "INSERT INTO assets (
                company_id, canonical_name, modality, target, is_disclosed, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                company_id,
                canonical_name,
                modality,
                target,
                is_disclosed as i64,
                Self::now()
            ],
        )?;
        Ok(AssetRow {
            id: self.conn.last_insert_rowid(),
            company_id: company_id.to_string(),
            canonical_name: canonical_name.to_string(),
            modality: modality.map(ToOwned::to_owned),
            target: target.map(ToOwned::to_owned),
            is_disclosed,
        })
    }

    pub fn find_asset_by_name(
        &self,
        company_id: &str,
        canonical_name: &str,
    ) -> rusqlite::Result<Option<AssetRow>> {
        self.conn
            .query_row(
                "SELECT id, company_id, canonical_name, modality, target, is_disclosed
                 FROM assets WHERE company_id = ?1 AND canonical_name = ?2",
                params![company_id, canonical_name],
                Self::read_asset_row,
            )
            .optional()
    }

    pub fn asset_by_id(&self, asset_id: i64) -> rusqlite::Result<Option<AssetRow>> {
        self.conn
            .query_row(
                "SELECT id, company_id, canonical_name, modality, target, is_disclosed
                 FROM assets WHERE id = ?1",
                params![asset_id],
                Self::read_asset_row,
            )
            .optional()
    }

    pub fn assets_for_company(&self, company_id: &str) -> rusqlite::Result<Vec<AssetRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, company_id, canonical_name, modality, target, is_disclosed
             FROM assets WHERE company_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![company_id], Self::read_asset_row)?;
        rows.collect()
    }

    fn read_asset_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AssetRow> {
        Ok(AssetRow {
            id: row.get(0)?,
            company_id: row.get(1)?,
            canonical_name: row.get(2)?,
            modality: row.get(3)?,
            target: row.get(4)?,
            is_disclosed: row.get::<_, i64>(5)? != 0,
        })
    }

    /// Idempotent insert guarded by the (asset_id, alias_norm) invariant.
    pub fn ensure_alias(&self, asset_id: i64, alias: &str) -> rusqlite::Result<()> {
        let alias_norm = norm_text(alias);
        if alias_norm.is_empty() {
            return Ok(());
        }
        self.conn.execute(
            "INSERT OR IGNORE INTO asset_aliases (asset_id, alias, alias_norm) VALUES (?1, ?2, ?3)",
            params![asset_id, alias, alias_norm],
        )?;
        Ok(())
    }

    /// `(alias_id, alias, alias_norm)` for one asset, lowest id first.
    pub fn aliases_for_asset(&self, asset_id: i64) -> rusqlite::Result<Vec<(i64, String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, alias, alias_norm FROM asset_aliases WHERE asset_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![asset_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        rows.collect()
    }

    /// Atomic delete-all + insert: sidesteps transient uniqueness violations
    /// that updating rows in place would hit when two existing aliases
    /// sanitize to the same normalized value.
    pub fn replace_aliases(&self, asset_id: i64, aliases: &[(String, String)]) -> rusqlite::Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM asset_aliases WHERE asset_id = ?1", params![asset_id])?;
        for (alias, alias_norm) in aliases {
            tx.execute(
                "INSERT INTO asset_aliases (asset_id, alias, alias_norm) VALUES (?1, ?2, ?3)",
                params![asset_id, alias, alias_norm],
            )?;
        }
        tx.commit()
    }

    /// `alias_norm -> asset_id` for a whole company, the linker's index.
    pub fn alias_index(&self, company_id: &str) -> rusqlite::Result<Vec<(String, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT aa.alias_norm, aa.asset_id
             FROM asset_aliases aa JOIN assets a ON a.id = aa.asset_id
             WHERE a.company_id = ?1
             ORDER BY aa.id ASC",
        )?;
        let rows = stmt.query_map(params![company_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect()
    }

    /// Raw alias spellings for a company, used as registry query terms.
    pub fn alias_terms(&self, company_id: &str) -> rusqlite::Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT aa.alias
             FROM asset_aliases aa JOIN assets a ON a.id = aa.asset_id
             WHERE a.company_id = ?1
             ORDER BY aa.id ASC",
        )?;
        let rows = stmt.query_map(params![company_id], |row| row.get(0))?;
        rows.collect()
    }

    /// Replace the snapshot rows for (asset, evidence) wholesale.
    /// Returns `(deleted, inserted)`.
    pub fn replace_asset_indications(
        &self,
        asset_id: i64,
        evidence_id: i64,
        facts: &[IndicationFact],
        as_of_date: Option<&str>,
    ) -> rusqlite::Result<(usize, usize)> {
        let tx = self.conn.unchecked_transaction()?;
        let deleted = tx.execute(
            "DELETE FROM asset_indications WHERE asset_id = ?1 AND evidence_id = ?2",
            params![asset_id, evidence_id],
        )?;
        let mut inserted = 0;
        for fact in facts {
            tx.execute(
                "INSERT INTO asset_indications (
                    asset_id, indication, stage, therapeutic_area, as_of_date, evidence_id
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    asset_id,
                    fact.indication.trim(),
                    fact.stage.trim(),
                    fact.therapeutic_area,
                    as_of_date,
                    evidence_id
                ],
            )?;
            inserted += 1;
        }
        tx.commit()?;
        Ok((deleted, inserted))
    }

    /// The exact indication set for one snapshot.
    pub fn current_indications_for_evidence(
        &self,
        asset_id: i64,
        evidence_id: i64,
    ) -> rusqlite::Result<BTreeSet<IndKey>> {
        let mut stmt = self.conn.prepare(
            "SELECT indication, stage, therapeutic_area
             FROM asset_indications WHERE asset_id = ?1 AND evidence_id = ?2",
        )?;
        let rows = stmt.query_map(params![asset_id, evidence_id], Self::read_ind_key)?;
        rows.collect()
    }

    /// The indication set of the highest *other* evidence id for this asset,
    /// a proxy for the most recent prior snapshot; empty if none exists.
    pub fn latest_indications_before(
        &self,
        asset_id: i64,
        evidence_id: i64,
    ) -> rusqlite::Result<BTreeSet<IndKey>> {
        let latest: Option<i64> = self
            .conn
            .query_row(
                "SELECT MAX(evidence_id) FROM asset_indications
                 WHERE asset_id = ?1 AND evidence_id != ?2",
                params![asset_id, evidence_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        let Some(latest) = latest else {
            return Ok(BTreeSet::new());
        };
        self.current_indications_for_evidence(asset_id, latest)
    }

    fn read_ind_key(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndKey> {
        let ta: Option<String> = row.get(2)?;
        Ok((
            row.get::<_, String>(0)?.trim().to_string(),
            row.get::<_, String>(1)?.trim().to_string(),
            ta.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
        ))
    }

    /// Upsert one registry study by external identifier. Field updates
    /// follow keep-first/take-latest rules; a status update is reported only
    /// when the value actually changed.
    pub fn upsert_trial(
        &self,
        company_id: &str,
        core: &TrialCore,
        evidence_id: i64,
    ) -> rusqlite::Result<TrialUpsert> {
        let collaborators = serde_json::to_string(&core.collaborators)
            .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))?;

        let existing: Option<(i64, Option<String>, Option<String>, Option<String>, Option<String>)> = self
            .conn
            .query_row(
                "SELECT id, title, overall_status, phase, last_update_posted
                 FROM trials WHERE company_id = ?1 AND registry_id = ?2",
                params![company_id, core.registry_id],
                |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                },
            )
            .optional()?;

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO trials (
                        company_id, registry_id, title, overall_status, phase,
                        start_date, last_update_posted, lead_sponsor, collaborators,
                        source_url, fetched_at, evidence_id
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        company_id,
                        core.registry_id,
                        core.title,
                        core.overall_status,
                        core.phase,
                        core.start_date,
                        core.last_update_posted,
                        core.lead_sponsor,
                        collaborators,
                        core.source_url,
                        Self::now(),
                        evidence_id
                    ],
                )?;
                Ok(TrialUpsert {
                    trial_id: self.conn.last_insert_rowid(),
                    created: true,
                    status_changed: None,
                })
            }
            Some((trial_id, old_title, old_status, old_phase, old_posted)) => {
                let status_changed = match (&old_status, &core.overall_status) {
                    (old, Some(new)) if old.as_deref() != Some(new.as_str()) => {
                        Some((old.clone(), new.clone()))
                    }
                    _ => None,
                };
                let title = old_title.or_else(|| core.title.clone());
                let status = core.overall_status.clone().or(old_status);
                let phase = core.phase.clone().or(old_phase);
                let posted = core.last_update_posted.clone().or(old_posted);
                self.conn.execute(
                    "UPDATE trials SET title = ?1, overall_status = ?2, phase = ?3,
                        last_update_posted = ?4, collaborators = ?5, fetched_at = ?6,
                        evidence_id = ?7
                     WHERE id = ?8",
                    params![title, status, phase, posted, collaborators, Self::now(), evidence_id, trial_id],
                )?;
                Ok(TrialUpsert {
                    trial_id,
                    created: false,
                    status_changed,
                })
            }
        }
    }

    pub fn trial_interventions(&self, trial_id: i64) -> rusqlite::Result<Vec<(String, Option<String>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, intervention_type FROM trial_interventions
             WHERE trial_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![trial_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect()
    }

    /// Child facts of a trial are always replaced wholesale, never patched.
    pub fn replace_trial_children(
        &self,
        trial_id: i64,
        interventions: &[(String, Option<String>)],
        conditions: &[String],
    ) -> rusqlite::Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM trial_interventions WHERE trial_id = ?1", params![trial_id])?;
        tx.execute("DELETE FROM trial_conditions WHERE trial_id = ?1", params![trial_id])?;
        for (name, kind) in interventions {
            tx.execute(
                "INSERT INTO trial_interventions (trial_id, name, intervention_type)
                 VALUES (?1, ?2, ?3)",
                params![trial_id, name, kind],
            )?;
        }
        for condition in conditions {
            tx.execute(
                "INSERT INTO trial_conditions (trial_id, condition) VALUES (?1, ?2)",
                params![trial_id, condition],
            )?;
        }
        tx.commit()
    }

    /// The link set for a trial is a pure function of its interventions and
    /// the current alias index: rebuild it atomically every time.
    pub fn replace_trial_links(&self, trial_id: i64, links: &[ResolvedLink]) -> rusqlite::Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM trial_asset_links WHERE trial_id = ?1", params![trial_id])?;
        for link in links {
            tx.execute(
                "INSERT INTO trial_asset_links (trial_id, asset_id, match_type, match_score)
                 VALUES (?1, ?2, ?3, ?4)",
                params![trial_id, link.asset_id, link.kind.as_str(), link.score],
            )?;
        }
        tx.commit()
    }

    pub fn links_for_trial(&self, trial_id: i64) -> rusqlite::Result<Vec<ResolvedLink>> {
        let mut stmt = self.conn.prepare(
            "SELECT asset_id, match_type, match_score FROM trial_asset_links
             WHERE trial_id = ?1 ORDER BY asset_id ASC",
        )?;
        let rows = stmt.query_map(params![trial_id], |row| {
            Ok(ResolvedLink {
                asset_id: row.get(0)?,
                kind: decode_match_kind(&row.get::<_, String>(1)?),
                score: row.get(2)?,
            })
        })?;
        rows.collect()
    }

    pub fn emit_change(
        &self,
        company_id: &str,
        event_type: &str,
        payload: Value,
        refs: ChangeRefs,
    ) -> rusqlite::Result<i64> {
        self.conn.execute(
            "INSERT INTO change_events (
                company_id, event_type, occurred_at, payload, evidence_id, asset_id, trial_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                company_id,
                event_type,
                Self::now(),
                payload.to_string(),
                refs.evidence_id,
                refs.asset_id,
                refs.trial_id
            ],
        )?;
        tracing::info!(company = company_id, event = event_type, "change event");
        Ok(self.conn.last_insert_rowid())
    }

    /// Committed immediately so a crashed run is never silently invisible.
    /// The id of an unfinished run for this company, if any. Entity
    /// resolution is not safe under concurrent writers, so callers warn
    /// before starting a second run.
    pub fn open_run(&self, company_id: &str) -> rusqlite::Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT id FROM ingestion_runs
                 WHERE company_id = ?1 AND finished_at IS NULL
                 ORDER BY id DESC LIMIT 1",
                params![company_id],
                |row| row.get(0),
            )
            .optional()
    }

    pub fn start_run(&self, company_id: &str, run_type: &str) -> rusqlite::Result<i64> {
        self.conn.execute(
            "INSERT INTO ingestion_runs (company_id, run_type, started_at, status)
             VALUES (?1, ?2, ?3, 'running')",
            params![company_id, run_type, Self::now()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn finish_run(&self, run_id: i64, status: RunStatus, notes: Option<&str>) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE ingestion_runs SET status = ?1, notes = ?2, finished_at = ?3 WHERE id = ?4",
            params![status.as_str(), notes, Self::now(), run_id],
        )?;
        Ok(())
    }

    pub fn runs_for_company(&self, company_id: &str) -> rusqlite::Result<Vec<RunRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, company_id, run_type, started_at, finished_at, status, notes
             FROM ingestion_runs WHERE company_id = ?1 ORDER BY id DESC",
        )?;
        let rows = stmt.query_map(params![company_id], |row| {
            Ok(RunRow {
                id: row.get(0)?,
                company_id: row.get(1)?,
                run_type: row.get(2)?,
                started_at: row.get(3)?,
                finished_at: row.get(4)?,
                status: row.get(5)?,
                notes: row.get(6)?,
            })
        })?;
        rows.collect()
    }

    pub fn recent_events(&self, company_id: &str, limit: usize) -> rusqlite::Result<Vec<ChangeEventRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, company_id, event_type, occurred_at, payload, evidence_id, asset_id, trial_id
             FROM change_events WHERE company_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![company_id, limit as i64], |row| {
            let payload: String = row.get(4)?;
            Ok(ChangeEventRow {
                id: row.get(0)?,
                company_id: row.get(1)?,
                event_type: row.get(2)?,
                occurred_at: row.get(3)?,
                payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
                evidence_id: row.get(5)?,
                asset_id: row.get(6)?,
                trial_id: row.get(7)?,
            })
        })?;
        rows.collect()
    }

    pub fn count_events(&self, company_id: &str) -> rusqlite::Result<i64> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM change_events WHERE company_id = ?1",
            params![company_id],
            |row| row.get(0),
        )
    }

    pub fn count_indications(&self, asset_id: i64) -> rusqlite::Result<i64> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM asset_indications WHERE asset_id = ?1",
            params![asset_id],
            |row| row.get(0),
        )
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded() -> Store {
        let store = Store::open_in_memory().expect("in-memory store");
        store.ensure_company("jnj", "Johnson & Johnson").expect("company");
        store
    }

    fn evidence(store: &Store, url: &str) -> i64 {
        store
            .add_evidence("jnj", "pipeline_pdf", url, "deadbeef", "/tmp/x.pdf", &json!({}), None)
            .expect("evidence")
    }

    #[test]
    fn upsert_asset_is_idempotent_and_patches_changed_fields() {
        let store = seeded();
        let a = store.upsert_asset("jnj", "JNJ-1900", None, None, true).expect("insert");
        let b = store
            .upsert_asset("jnj", "JNJ-1900", Some("radioenhancer"), None, true)
            .expect("update");
        assert_eq!(a.id, b.id);
        assert_eq!(b.modality.as_deref(), Some("radioenhancer"));
        let c = store.upsert_asset("jnj", "JNJ-1900", None, None, true).expect("noop");
        assert_eq!(c.modality.as_deref(), Some("radioenhancer"));
    }

    #[test]
    fn ensure_alias_enforces_norm_uniqueness() {
        let store = seeded();
        let asset = store.upsert_asset("jnj", "JNJ-1900", None, None, true).expect("asset");
        store.ensure_alias(asset.id, "NBTXR3").expect("alias");
        store.ensure_alias(asset.id, "nbtxr3").expect("dup alias no-op");
        store.ensure_alias(asset.id, "NBTXR3 ").expect("dup alias no-op");
        assert_eq!(store.aliases_for_asset(asset.id).expect("aliases").len(), 1);
    }

    #[test]
    fn snapshot_replacement_is_wholesale() {
        let store = seeded();
        let asset = store.upsert_asset("jnj", "JNJ-1900", None, None, true).expect("asset");
        let ev = evidence(&store, "https://x/pipeline.pdf");
        let facts = vec![IndicationFact {
            indication: "NSCLC".to_string(),
            stage: "Phase 2".to_string(),
            therapeutic_area: None,
        }];
        let (deleted, inserted) = store
            .replace_asset_indications(asset.id, ev, &facts, Some("2026-01-21"))
            .expect("replace");
        assert_eq!((deleted, inserted), (0, 1));
        let (deleted, inserted) = store
            .replace_asset_indications(asset.id, ev, &facts, Some("2026-01-21"))
            .expect("replace again");
        assert_eq!((deleted, inserted), (1, 1));
        assert_eq!(store.count_indications(asset.id).expect("count"), 1);
    }

    #[test]
    fn latest_prior_snapshot_uses_highest_other_evidence_id() {
        let store = seeded();
        let asset = store.upsert_asset("jnj", "JNJ-1900", None, None, true).expect("asset");
        let ev1 = evidence(&store, "https://x/1.pdf");
        let ev2 = evidence(&store, "https://x/2.pdf");
        let ev3 = evidence(&store, "https://x/3.pdf");
        let fact = |ind: &str, stage: &str| IndicationFact {
            indication: ind.to_string(),
            stage: stage.to_string(),
            therapeutic_area: None,
        };
        store
            .replace_asset_indications(asset.id, ev1, &[fact("NSCLC", "Phase 1")], None)
            .expect("snap 1");
        store
            .replace_asset_indications(asset.id, ev2, &[fact("NSCLC", "Phase 2")], None)
            .expect("snap 2");

        let before = store.latest_indications_before(asset.id, ev3).expect("latest");
        assert_eq!(before.len(), 1);
        assert!(before.contains(&("NSCLC".to_string(), "Phase 2".to_string(), None)));

        let none = store
            .latest_indications_before(asset.id, ev1)
            .expect("excluding self");
        assert!(none.contains(&("NSCLC".to_string(), "Phase 2".to_string(), None)));
    }

    #[test]
    fn trial_upsert_reports_real_status_changes_only() {
        let store = seeded();
        let ev = evidence(&store, "https://registry/NCT1");
        let mut core = TrialCore {
            registry_id: "NCT00000001".to_string(),
            title: Some("A study".to_string()),
            overall_status: Some("RECRUITING".to_string()),
            source_url: "https://registry/NCT00000001".to_string(),
            ..TrialCore::default()
        };
        let first = store.upsert_trial("jnj", &core, ev).expect("insert");
        assert!(first.created);

        let second = store.upsert_trial("jnj", &core, ev).expect("same status");
        assert!(!second.created);
        assert!(second.status_changed.is_none());

        core.overall_status = Some("ACTIVE_NOT_RECRUITING".to_string());
        let third = store.upsert_trial("jnj", &core, ev).expect("new status");
        assert_eq!(
            third.status_changed,
            Some((
                Some("RECRUITING".to_string()),
                "ACTIVE_NOT_RECRUITING".to_string()
            ))
        );
    }

    #[test]
    fn link_rebuild_never_accumulates() {
        let store = seeded();
        let asset = store.upsert_asset("jnj", "JNJ-1900", None, None, true).expect("asset");
        let ev = evidence(&store, "https://registry/NCT1");
        let core = TrialCore {
            registry_id: "NCT00000001".to_string(),
            source_url: "https://registry/NCT00000001".to_string(),
            ..TrialCore::default()
        };
        let trial = store.upsert_trial("jnj", &core, ev).expect("trial");
        let link = ResolvedLink {
            asset_id: asset.id,
            kind: MatchKind::Exact,
            score: 100,
        };
        store.replace_trial_links(trial.trial_id, &[link]).expect("link");
        store.replace_trial_links(trial.trial_id, &[link]).expect("relink");
        assert_eq!(store.links_for_trial(trial.trial_id).expect("links").len(), 1);
    }

    #[test]
    fn run_ledger_records_start_and_finish() {
        let store = seeded();
        let run_id = store.start_run("jnj", "pipeline").expect("start");
        store
            .finish_run(run_id, RunStatus::Error, Some("http error"))
            .expect("finish");
        let runs = store.runs_for_company("jnj").expect("runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, "error");
        assert_eq!(runs[0].notes.as_deref(), Some("http error"));
        assert!(runs[0].finished_at.is_some());
    }
}
