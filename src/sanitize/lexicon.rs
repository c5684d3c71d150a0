//! Keyword tables that tune the label classifier.
//!
//! These lists are product-tuning data, not load-bearing design: defaults
//! ship in code and a settings file may extend any of them.

use serde::Deserialize;

/// Column headers and section labels that leak from PDFs and are never
/// asset names on their own.
pub const STOP_ASSET_EXACT: &[&str] = &[
    "indications",
    "indication",
    "delivery",
    "intravesical delivery",
    "system",
    "platform",
    "mechanism",
    "target",
    "targets",
    "oncology",
    "immunology",
    "neuroscience",
    "select other areas",
    "pediatrics",
    "colitis",
    "autoleucel",
];

/// Garbled mechanism fragments, compared with spaces removed.
/// "Factor XIa" gets clipped into "a c t o r X I a" -> "actorxia".
pub const STOP_ASSET_NOSPACE: &[&str] = &["factorxia", "actorxia"];

/// Corporate/partner-entity tokens that never belong in an asset name.
pub const CORP_TOKENS: &[&str] = &[
    "plc",
    "biosciences",
    "therapeutics",
    "pharma",
    "pharmaceutical",
    "corporation",
    "gmbh",
    "ltd",
    "inc",
    "ag",
];

pub const PLACEHOLDERS: &[&str] = &["others", "other", "unknown", "undisclosed"];

/// Disease and anatomy roots that mark a label as indication-like. Matching
/// tolerates one dropped leading character, a common OCR artifact.
pub const DISEASE_KEYWORDS: &[&str] = &[
    "anemia",
    "arthritis",
    "asthma",
    "cancer",
    "carcinoma",
    "colitis",
    "dermatitis",
    "diabetes",
    "disease",
    "disorder",
    "fibrosis",
    "hemolytic",
    "hypertension",
    "leukemia",
    "lymphoma",
    "melanoma",
    "myeloma",
    "nephropathy",
    "neoplasm",
    "psoriasis",
    "pulmonary",
    "sarcoma",
    "sclerosis",
    "syndrome",
    "thrombosis",
    "tumor",
    "tumour",
    "lupus",
    "dermatomyositis",
    "glioma",
    "glioblastoma",
    "amyloidosis",
    "retinopathy",
    "macular",
    "alzheimer",
    "parkinson",
    "depression",
    "schizophrenia",
    "obesity",
    "hepatitis",
    "infection",
];

pub const ANATOMY_KEYWORDS: &[&str] = &[
    "bladder",
    "breast",
    "colorectal",
    "gastric",
    "hepatic",
    "lung",
    "ovarian",
    "pancreatic",
    "prostate",
    "renal",
    "urothelial",
    "esophageal",
    "cervical",
    "endometrial",
    "cutaneous",
    "arterial",
];

/// Route/dosage/procedure vocabulary; indication text, never asset names.
pub const ROUTE_PROCEDURE_KEYWORDS: &[&str] = &[
    "intravenous",
    "subcutaneous",
    "intravesical",
    "oral",
    "topical",
    "inhaled",
    "injection",
    "infusion",
    "monotherapy",
    "combination therapy",
    "adjuvant",
    "neoadjuvant",
    "first-line",
    "second-line",
    "relapsed",
    "refractory",
    "maintenance",
    "transplant",
    "resection",
    "line of therapy",
];

/// Disclaimer/footer phrases that terminate indication text.
pub const INDICATION_CUTOFFS: &[&str] = &[
    "inclusion in",
    "inclusion of",
    "through clinical trials",
    "to the best of the company's knowledge",
    "to the best of the companys knowledge",
    "the company assumes no obligation",
    "strategic partnerships",
    "*this is not",
    "this is not intended",
];

/// Generic-name suffixes that mark a trial intervention term as drug-like.
pub const DRUG_NAME_SUFFIXES: &[&str] = &[
    "mab", "nib", "cel", "gene", "tide", "vec", "ciclib", "lisib", "parib",
    "sertib", "degib", "rafenib", "tinib", "zomib", "leucel", "statin",
    "prazole", "sartan", "oxetine", "azepam", "icant", "ument", "lutamide",
];

/// Dosage/route noise stripped from intervention names before matching.
pub const INTERVENTION_NOISE: &[&str] = &[
    "mg", "ml", "mcg", "dose", "doses", "tablet", "tablets", "capsule",
    "capsules", "injection", "infusion", "oral", "iv", "sc", "placebo",
    "solution", "fixed", "low", "high",
];

/// Overlay parsed from the settings file; every list extends the defaults.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct LexiconOverlay {
    #[serde(default)]
    pub stop_asset_exact: Vec<String>,
    #[serde(default)]
    pub corp_tokens: Vec<String>,
    #[serde(default)]
    pub disease_keywords: Vec<String>,
    #[serde(default)]
    pub route_keywords: Vec<String>,
    #[serde(default)]
    pub indication_cutoffs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Lexicon {
    pub stop_asset_exact: Vec<String>,
    pub stop_asset_nospace: Vec<String>,
    pub corp_tokens: Vec<String>,
    pub placeholders: Vec<String>,
    pub disease_keywords: Vec<String>,
    pub anatomy_keywords: Vec<String>,
    pub route_keywords: Vec<String>,
    pub indication_cutoffs: Vec<String>,
    pub drug_suffixes: Vec<String>,
    pub intervention_noise: Vec<String>,
}

impl Default for Lexicon {
    fn default() -> Self {
        fn owned(items: &[&str]) -> Vec<String> {
            items.iter().map(|s| s.to_string()).collect()
        }
        Self {
            stop_asset_exact: owned(STOP_ASSET_EXACT),
            stop_asset_nospace: owned(STOP_ASSET_NOSPACE),
            corp_tokens: owned(CORP_TOKENS),
            placeholders: owned(PLACEHOLDERS),
            disease_keywords: owned(DISEASE_KEYWORDS),
            anatomy_keywords: owned(ANATOMY_KEYWORDS),
            route_keywords: owned(ROUTE_PROCEDURE_KEYWORDS),
            indication_cutoffs: owned(INDICATION_CUTOFFS),
            drug_suffixes: owned(DRUG_NAME_SUFFIXES),
            intervention_noise: owned(INTERVENTION_NOISE),
        }
    }
}

impl Lexicon {
    pub fn with_overlay(overlay: &LexiconOverlay) -> Self {
        let mut lex = Self::default();
        lex.extend_lowered(&overlay.stop_asset_exact, |l| &mut l.stop_asset_exact);
        lex.extend_lowered(&overlay.corp_tokens, |l| &mut l.corp_tokens);
        lex.extend_lowered(&overlay.disease_keywords, |l| &mut l.disease_keywords);
        lex.extend_lowered(&overlay.route_keywords, |l| &mut l.route_keywords);
        lex.extend_lowered(&overlay.indication_cutoffs, |l| &mut l.indication_cutoffs);
        lex
    }

    fn extend_lowered(&mut self, extra: &[String], field: impl Fn(&mut Self) -> &mut Vec<String>) {
        let additions: Vec<String> = extra
            .iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        let target = field(self);
        for addition in additions {
            if !target.contains(&addition) {
                target.push(addition);
            }
        }
    }
}
