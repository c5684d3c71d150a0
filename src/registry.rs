//! ClinicalTrials.gov v2 client: paginated intervention searches, sponsor
//! ownership checks, and extraction of the trial core we persist.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{DossierError, Result};
use crate::http::Fetcher;
use crate::link::Intervention;
use crate::normalize::norm_text;
use crate::store::TrialCore;

pub const STUDIES_ENDPOINT: &str = "https://clinicaltrials.gov/api/v2/studies";

pub const DEFAULT_ACTIVE_STATUSES: &[&str] = &[
    "NOT_YET_RECRUITING",
    "RECRUITING",
    "ENROLLING_BY_INVITATION",
    "ACTIVE_NOT_RECRUITING",
];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Study {
    #[serde(default)]
    pub protocol_section: ProtocolSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolSection {
    #[serde(default)]
    pub identification_module: IdentificationModule,
    #[serde(default)]
    pub status_module: StatusModule,
    #[serde(default)]
    pub design_module: DesignModule,
    #[serde(default)]
    pub sponsor_collaborators_module: SponsorCollaboratorsModule,
    #[serde(default)]
    pub conditions_module: ConditionsModule,
    #[serde(default)]
    pub arms_interventions_module: ArmsInterventionsModule,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentificationModule {
    pub nct_id: Option<String>,
    pub brief_title: Option<String>,
    pub official_title: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusModule {
    pub overall_status: Option<String>,
    #[serde(default)]
    pub start_date_struct: DateStruct,
    #[serde(default)]
    pub last_update_post_date_struct: DateStruct,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DateStruct {
    pub date: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DesignModule {
    #[serde(default)]
    pub phases: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SponsorCollaboratorsModule {
    #[serde(default)]
    pub lead_sponsor: NamedParty,
    #[serde(default)]
    pub collaborators: Vec<NamedParty>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NamedParty {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConditionsModule {
    #[serde(default)]
    pub conditions: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArmsInterventionsModule {
    #[serde(default)]
    pub interventions: Vec<StudyIntervention>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudyIntervention {
    #[serde(rename = "type")]
    pub intervention_type: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub other_names: Vec<String>,
}

impl Study {
    pub fn nct_id(&self) -> Option<&str> {
        self.protocol_section.identification_module.nct_id.as_deref()
    }

    /// Ownership check: lead sponsor or any collaborator must contain one of
    /// the configured sponsor aliases after normalization.
    pub fn belongs_to(&self, sponsor_aliases: &[String]) -> bool {
        let module = &self.protocol_section.sponsor_collaborators_module;
        let hit = |name: &Option<String>| {
            name.as_deref().is_some_and(|n| {
                let normed = norm_text(n);
                sponsor_aliases
                    .iter()
                    .any(|alias| !alias.is_empty() && normed.contains(&norm_text(alias)))
            })
        };
        hit(&module.lead_sponsor.name) || module.collaborators.iter().any(|c| hit(&c.name))
    }

    pub fn core(&self) -> Option<TrialCore> {
        let ps = &self.protocol_section;
        let nct = ps.identification_module.nct_id.clone()?;
        let phases = &ps.design_module.phases;
        Some(TrialCore {
            registry_id: nct.clone(),
            title: ps
                .identification_module
                .official_title
                .clone()
                .or_else(|| ps.identification_module.brief_title.clone()),
            overall_status: ps.status_module.overall_status.clone(),
            phase: if phases.is_empty() { None } else { Some(phases.join(",")) },
            start_date: ps.status_module.start_date_struct.date.clone(),
            last_update_posted: ps.status_module.last_update_post_date_struct.date.clone(),
            lead_sponsor: ps.sponsor_collaborators_module.lead_sponsor.name.clone(),
            collaborators: ps
                .sponsor_collaborators_module
                .collaborators
                .iter()
                .filter_map(|c| c.name.clone())
                .collect(),
            source_url: format!("https://clinicaltrials.gov/study/{nct}"),
        })
    }

    pub fn interventions(&self) -> Vec<Intervention> {
        self.protocol_section
            .arms_interventions_module
            .interventions
            .iter()
            .filter_map(|it| {
                let name = it.name.as_deref()?.trim();
                if name.is_empty() {
                    return None;
                }
                Some(Intervention {
                    name: name.to_string(),
                    kind: it.intervention_type.clone(),
                    other_names: it.other_names.clone(),
                })
            })
            .collect()
    }

    pub fn conditions(&self) -> &[String] {
        &self.protocol_section.conditions_module.conditions
    }
}

/// The registry rejects malformed `query.intr` strings (stray parens, quote
/// chars). Strip those gently and drop terms that end up too short.
pub fn sanitize_search_term(term: &str, min_len: usize) -> Option<String> {
    let stripped: String = term
        .trim()
        .chars()
        .filter(|c| !matches!(c, '(' | ')' | '[' | ']' | '{' | '}' | '"' | '\'' | '<' | '>'))
        .collect();
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    let cleaned = collapsed.trim_matches([' ', ',', ';', ':', '.', '!', '/', '\\', '|']);
    if cleaned.len() < min_len {
        return None;
    }
    Some(cleaned.to_string())
}

/// Alias terms worth querying: sanitized, placeholder-free, deduped by norm,
/// shortest first since short codes are the most likely to be accepted.
pub fn query_alias_terms(aliases: &[String], min_len: usize) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out: Vec<String> = aliases
        .iter()
        .filter_map(|alias| sanitize_search_term(alias, min_len))
        .filter(|term| {
            let low = term.to_lowercase();
            !low.contains("undisclosed") && !matches!(low.as_str(), "other" | "others" | "unknown")
        })
        .filter(|term| seen.insert(norm_text(term)))
        .collect();
    out.sort_by_key(String::len);
    out
}

/// One study plus the raw JSON it was parsed from, kept for evidence storage.
pub struct StudyRecord {
    pub study: Study,
    pub raw: Value,
}

pub struct TermSearch {
    pub records: Vec<StudyRecord>,
    /// The registry returned 400 for this term; the caller skips it.
    pub rejected: bool,
}

pub struct RegistryClient<'a> {
    fetcher: &'a Fetcher,
    endpoint: String,
    page_size: u32,
    max_pages: u32,
    statuses: Vec<String>,
}

impl<'a> RegistryClient<'a> {
    pub fn new(fetcher: &'a Fetcher, page_size: u32, max_pages: u32, statuses: &[String]) -> Self {
        let statuses = if statuses.is_empty() {
            DEFAULT_ACTIVE_STATUSES.iter().map(|s| s.to_string()).collect()
        } else {
            statuses.to_vec()
        };
        Self {
            fetcher,
            endpoint: STUDIES_ENDPOINT.to_string(),
            page_size,
            max_pages,
            statuses,
        }
    }

    /// All studies matching one intervention term, across pages. A 400 from
    /// the registry marks the term rejected instead of failing the run; every
    /// other error aborts.
    pub fn search_intervention(&self, term: &str) -> Result<TermSearch> {
        let mut records = Vec::new();
        let mut page_token: Option<String> = None;
        let mut page = 0u32;

        loop {
            let mut query: Vec<(&str, String)> = vec![
                ("query.intr", term.to_string()),
                ("pageSize", self.page_size.to_string()),
                ("countTotal", "false".to_string()),
                ("format", "json".to_string()),
                ("filter.overallStatus", self.statuses.join(",")),
                ("sort", "LastUpdatePostDate:desc".to_string()),
            ];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }

            let response = match self.fetcher.get(&self.endpoint, &query) {
                Ok(resp) => resp,
                Err(DossierError::Status { status: 400, .. }) => {
                    tracing::warn!(term, "registry rejected intervention term, skipping");
                    return Ok(TermSearch { records, rejected: true });
                }
                Err(err) => return Err(err),
            };
            let body: Value = response.json()?;

            if let Some(studies) = body.get("studies").and_then(Value::as_array) {
                for raw in studies {
                    let study: Study = serde_json::from_value(raw.clone())?;
                    records.push(StudyRecord { study, raw: raw.clone() });
                }
            }

            page_token = body
                .get("nextPageToken")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned);
            page += 1;
            self.fetcher.polite_sleep()?;

            if page_token.is_none() {
                break;
            }
            if page >= self.max_pages {
                tracing::warn!(term, pages = page, "hit page cap for intervention term");
                break;
            }
        }

        Ok(TermSearch { records, rejected: false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn study_fixture() -> Study {
        serde_json::from_value(json!({
            "protocolSection": {
                "identificationModule": {
                    "nctId": "NCT04538664",
                    "briefTitle": "A Study of Amivantamab"
                },
                "statusModule": {
                    "overallStatus": "RECRUITING",
                    "startDateStruct": {"date": "2020-09-01"},
                    "lastUpdatePostDateStruct": {"date": "2026-02-11"}
                },
                "designModule": {"phases": ["PHASE3"]},
                "sponsorCollaboratorsModule": {
                    "leadSponsor": {"name": "Janssen Research & Development, LLC"},
                    "collaborators": [{"name": "Some University"}]
                },
                "conditionsModule": {"conditions": ["Non Small Cell Lung Cancer"]},
                "armsInterventionsModule": {
                    "interventions": [
                        {"type": "DRUG", "name": "Amivantamab", "otherNames": ["RYBREVANT"]},
                        {"type": "DRUG", "name": "Carboplatin"}
                    ]
                }
            }
        }))
        .expect("fixture deserializes")
    }

    #[test]
    fn core_extraction_falls_back_to_brief_title() {
        let study = study_fixture();
        let core = study.core().expect("has nct id");
        assert_eq!(core.registry_id, "NCT04538664");
        assert_eq!(core.title.as_deref(), Some("A Study of Amivantamab"));
        assert_eq!(core.phase.as_deref(), Some("PHASE3"));
        assert_eq!(core.overall_status.as_deref(), Some("RECRUITING"));
        assert_eq!(core.source_url, "https://clinicaltrials.gov/study/NCT04538664");
        assert_eq!(core.collaborators, vec!["Some University".to_string()]);
    }

    #[test]
    fn sponsor_check_matches_lead_and_collaborators() {
        let study = study_fixture();
        assert!(study.belongs_to(&["Janssen".to_string()]));
        assert!(study.belongs_to(&["some university".to_string()]));
        assert!(!study.belongs_to(&["Pfizer".to_string()]));
        assert!(!study.belongs_to(&[]));
    }

    #[test]
    fn interventions_carry_alternate_names() {
        let study = study_fixture();
        let interventions = study.interventions();
        assert_eq!(interventions.len(), 2);
        assert_eq!(interventions[0].name, "Amivantamab");
        assert_eq!(interventions[0].other_names, vec!["RYBREVANT".to_string()]);
        assert!(interventions[1].other_names.is_empty());
    }

    #[test]
    fn search_terms_are_sanitized() {
        assert_eq!(
            sanitize_search_term("autoleucel)", 4),
            Some("autoleucel".to_string())
        );
        assert_eq!(
            sanitize_search_term("  JNJ-1900   (NBTXR3) ", 4),
            Some("JNJ-1900 NBTXR3".to_string())
        );
        assert_eq!(sanitize_search_term("ab;", 4), None);
        assert_eq!(sanitize_search_term("   ", 4), None);
    }

    #[test]
    fn status_filter_override_replaces_active_default() {
        use crate::config::Settings;
        use crate::http::{Fetcher, ShutdownFlag};

        let settings = Settings::default();
        let fetcher = Fetcher::new(&settings, ShutdownFlag::default()).expect("fetcher");

        let defaulted = RegistryClient::new(&fetcher, 100, 50, &[]);
        assert_eq!(defaulted.statuses.len(), DEFAULT_ACTIVE_STATUSES.len());
        assert!(defaulted.statuses.iter().any(|s| s == "RECRUITING"));

        let overridden = RegistryClient::new(
            &fetcher,
            100,
            50,
            &["COMPLETED".to_string(), "TERMINATED".to_string()],
        );
        assert_eq!(
            overridden.statuses,
            vec!["COMPLETED".to_string(), "TERMINATED".to_string()]
        );
    }

    #[test]
    fn query_terms_skip_placeholders_and_dedupe() {
        let aliases = vec![
            "Undisclosed target".to_string(),
            "Others".to_string(),
            "amivantamab".to_string(),
            "Amivantamab".to_string(),
            "TAR-200".to_string(),
        ];
        let terms = query_alias_terms(&aliases, 4);
        assert_eq!(terms, vec!["TAR-200".to_string(), "amivantamab".to_string()]);
    }
}
