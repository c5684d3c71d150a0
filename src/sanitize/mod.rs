//! Cleaning and classification of raw labels scraped from disclosures.
//!
//! Everything here is pure: the same input always yields the same output,
//! which repeated re-ingestion relies on.

pub mod lexicon;

use std::sync::LazyLock;

use regex::Regex;

pub use lexicon::{Lexicon, LexiconOverlay};

static LEADING_BULLETS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[•·‣●\-\*]+\s*").expect("bullet regex"));
static PREFIX_ARTIFACT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(system|platform)\)\s*").expect("prefix regex"));
static ALLOWED_REJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9\-\+\./\(\) ]+").expect("allowed regex"));
static PROGRAM_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[a-z]{2,5}-\d{2,}\b|\b[A-Z]{2,4}\d{2,}(?:[A-Z]{1,4}\d{0,2})?\b")
        .expect("program code regex")
});
static TRIAL_ACRONYM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][A-Za-z]{2,13}-\d{1,2}[A-Za-z]?$").expect("acronym regex"));
static BRAND_GENERIC_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^.{2,60}\(.{2,60}\)$").expect("brand shape regex"));

/// Classifier over a keyword lexicon. Construct once per run.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    lexicon: Lexicon,
}

impl Classifier {
    pub fn new(lexicon: Lexicon) -> Self {
        Self { lexicon }
    }

    pub fn lexicon(&self) -> &Lexicon {
        &self.lexicon
    }

    /// Repair a raw scraped string into a candidate asset label, or `None`
    /// when nothing usable survives.
    pub fn sanitize_asset_label(&self, raw: &str) -> Option<String> {
        let mut s = raw.replace('\u{00a0}', " ");
        s = collapse_ws(s.trim());
        s = LEADING_BULLETS.replace(&s, "").into_owned();
        s = PREFIX_ARTIFACT.replace(&s, "").into_owned();
        s = ALLOWED_REJECT.replace_all(&s, "").into_owned();
        s = collapse_ws(&s);
        s = collapse_spaced_letters(&s);
        s = strip_unbalanced_parens(&s);
        let s = collapse_ws(&s);
        if s.is_empty() { None } else { Some(s) }
    }

    pub fn sanitize_alias(&self, raw: &str) -> Option<String> {
        self.sanitize_asset_label(raw)
    }

    /// Whether a cleaned label can stand as a drug/program name.
    pub fn is_plausible_asset_label(&self, label: &str) -> bool {
        let s = label.trim();
        if s.is_empty() {
            return false;
        }

        let low = s.to_lowercase();
        let nospace: String = low.chars().filter(|c| !c.is_whitespace()).collect();

        if self.lexicon.stop_asset_exact.iter().any(|x| *x == low) {
            return false;
        }
        if self.lexicon.stop_asset_nospace.iter().any(|x| *x == nospace) {
            return false;
        }
        if self.lexicon.placeholders.iter().any(|x| *x == low) {
            return false;
        }

        let word_tokens: Vec<&str> = low
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();
        if word_tokens
            .iter()
            .any(|t| self.lexicon.corp_tokens.iter().any(|c| c == t))
        {
            return false;
        }

        if !s.chars().any(|c| c.is_ascii_alphanumeric()) {
            return false;
        }
        // Characters outside the label whitelist mean the string never went
        // through sanitize_asset_label.
        if ALLOWED_REJECT.is_match(s) {
            return false;
        }
        // Very long "asset names" are partner blocks or footer leakage.
        if s.len() > 70 {
            return false;
        }
        if s.split_whitespace().count() > 6 && !is_program_code(s) {
            return false;
        }

        if self.looks_like_indication_label(s) {
            return false;
        }
        if is_trial_acronym(s) {
            return false;
        }

        true
    }

    /// Disease/indication shapes, tolerant of common OCR damage.
    pub fn looks_like_indication_label(&self, label: &str) -> bool {
        let low = label.trim().to_lowercase();
        if low.is_empty() {
            return false;
        }

        for prefix in ["of the ", "of ", "in the ", "to the "] {
            if low.starts_with(prefix) {
                return true;
            }
        }

        if self
            .lexicon
            .route_keywords
            .iter()
            .any(|kw| low.contains(kw.as_str()))
        {
            return true;
        }

        let tokens: Vec<&str> = low
            .split(|c: char| !c.is_ascii_alphabetic())
            .filter(|t| t.len() >= 3)
            .collect();
        for token in &tokens {
            if self.keyword_hit(token) {
                return true;
            }
        }

        // Camel-case truncations glue disease roots together without spaces:
        // "PulmonaryArterialH".
        if !label.contains(' ') {
            let humps = split_camel(label);
            if humps.len() >= 2 {
                for hump in &humps {
                    let hump_low = hump.to_lowercase();
                    if hump_low.len() >= 3 && self.keyword_hit(&hump_low) {
                        return true;
                    }
                }
            }
        }

        false
    }

    /// Exact or dropped-leading-character match against disease/anatomy roots.
    fn keyword_hit(&self, token: &str) -> bool {
        let roots = self
            .lexicon
            .disease_keywords
            .iter()
            .chain(self.lexicon.anatomy_keywords.iter());
        for root in roots {
            if token == root.as_str() {
                return true;
            }
            // OCR frequently drops the first character of a line.
            if root.len() > 4 && token == &root[1..] {
                return true;
            }
        }
        false
    }

    /// Clean free-running indication text accumulated from column lines.
    pub fn sanitize_indication_text(&self, raw: &str) -> String {
        let s = raw.replace('\u{00a0}', " ");
        let s = collapse_ws(&s);
        let s = deglue_camel_runs(&s);
        let low = s.to_lowercase();

        let mut cut = s.len();
        for pattern in &self.lexicon.indication_cutoffs {
            if let Some(pos) = low.find(pattern.as_str())
                && pos < cut
                && s.is_char_boundary(pos)
            {
                cut = pos;
            }
        }
        s[..cut].trim_end_matches([' ', ';', ',', '-']).trim().to_string()
    }
}

/// Company-prefix program codes: `JNJ-1900`, `IMA203`, `mRNA-4203`.
pub fn is_program_code(label: &str) -> bool {
    PROGRAM_CODE.is_match(label)
}

/// Registry study nicknames like `MARIPOSA-2`; program codes are exempt.
pub fn is_trial_acronym(label: &str) -> bool {
    let s = label.trim();
    TRIAL_ACRONYM.is_match(s) && !is_program_code(s)
}

/// `"brand (generic)"` visual shape used by the layout classifier.
pub fn has_brand_generic_shape(label: &str) -> bool {
    BRAND_GENERIC_SHAPE.is_match(label) && label.chars().any(|c| c.is_ascii_lowercase())
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fix OCR-style letter-spaced runs: "a c t o r X I a" -> "actorXIa".
/// Only triggers when single-character tokens dominate the string.
fn collapse_spaced_letters(s: &str) -> String {
    let tokens: Vec<&str> = s.split_whitespace().collect();
    if tokens.len() < 6 {
        return s.to_string();
    }
    let singles = tokens
        .iter()
        .filter(|t| t.len() == 1 && t.chars().all(|c| c.is_ascii_alphanumeric()))
        .count();
    if singles >= 5 && (singles as f64) / (tokens.len() as f64) >= 0.6 {
        tokens.concat()
    } else {
        s.to_string()
    }
}

fn strip_unbalanced_parens(s: &str) -> String {
    let mut s = s.to_string();
    loop {
        let opens = s.matches('(').count();
        let closes = s.matches(')').count();
        if s.ends_with(')') && opens < closes {
            s.pop();
            s = s.trim_end().to_string();
            continue;
        }
        if s.starts_with('(') && opens > closes {
            s.remove(0);
            s = s.trim_start().to_string();
            continue;
        }
        break;
    }
    s
}

/// Insert spaces into camelCase/ALLCAPS run-ons:
/// "metastaticNSCLC" -> "metastatic NSCLC", "NSCLCTreatment" -> "NSCLC Treatment".
fn deglue_camel_runs(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 8);
    for (idx, &ch) in chars.iter().enumerate() {
        if idx > 0 {
            let prev = chars[idx - 1];
            let next_lower = chars.get(idx + 1).is_some_and(|c| c.is_ascii_lowercase());
            if prev.is_ascii_lowercase() && ch.is_ascii_uppercase() {
                out.push(' ');
            } else if prev.is_ascii_uppercase() && ch.is_ascii_uppercase() && next_lower {
                out.push(' ');
            }
        }
        out.push(ch);
    }
    out
}

fn split_camel(s: &str) -> Vec<String> {
    deglue_camel_runs(s)
        .split_whitespace()
        .map(ToOwned::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier::default()
    }

    #[test]
    fn cleans_bullets_nbsp_and_junk_chars() {
        let c = classifier();
        assert_eq!(
            c.sanitize_asset_label("\u{2022} DARZALEX\u{00a0}(daratumumab)").as_deref(),
            Some("DARZALEX (daratumumab)")
        );
        assert_eq!(c.sanitize_asset_label("  |;: ").as_deref(), None);
    }

    #[test]
    fn strips_prefix_artifacts() {
        let c = classifier();
        assert_eq!(c.sanitize_asset_label("system) TAR-200").as_deref(), Some("TAR-200"));
    }

    #[test]
    fn collapses_letter_spaced_runs() {
        let c = classifier();
        let cleaned = c.sanitize_asset_label("a c t o r X I a").expect("cleaned");
        assert_eq!(cleaned, "actorXIa");
        // A normal short phrase is left alone.
        assert_eq!(
            c.sanitize_asset_label("a b real label").as_deref(),
            Some("a b real label")
        );
    }

    #[test]
    fn balances_edge_parens() {
        let c = classifier();
        assert_eq!(c.sanitize_asset_label("autoleucel)").as_deref(), Some("autoleucel"));
        assert_eq!(c.sanitize_asset_label("(nipocalimab").as_deref(), Some("nipocalimab"));
    }

    #[test]
    fn program_code_label_is_plausible() {
        let c = classifier();
        let cleaned = c.sanitize_asset_label("JNJ-1900 (NBTXR3)").expect("cleaned");
        assert!(c.is_plausible_asset_label(&cleaned));
        assert!(is_program_code(&cleaned));
    }

    #[test]
    fn indication_labels_are_rejected_as_assets() {
        let c = classifier();
        assert!(c.looks_like_indication_label("Hemolytic Anemia"));
        assert!(!c.is_plausible_asset_label("Hemolytic Anemia"));
    }

    #[test]
    fn tolerates_dropped_leading_character() {
        let c = classifier();
        assert!(c.looks_like_indication_label("emolytic anemia"));
        assert!(c.looks_like_indication_label("ulmonary hypertension"));
    }

    #[test]
    fn camel_case_truncation_is_indication_like() {
        let c = classifier();
        assert!(c.looks_like_indication_label("PulmonaryArterialH"));
        assert!(!c.is_plausible_asset_label("PulmonaryArterialH"));
    }

    #[test]
    fn dangling_preposition_is_indication_like() {
        let c = classifier();
        assert!(c.looks_like_indication_label("of the bladder"));
    }

    #[test]
    fn trial_acronyms_are_not_assets() {
        let c = classifier();
        assert!(is_trial_acronym("MARIPOSA-2"));
        assert!(!c.is_plausible_asset_label("MARIPOSA-2"));
        // Program codes share the hyphen-digit shape but stay assets.
        assert!(!is_trial_acronym("JNJ-1900"));
    }

    #[test]
    fn stop_words_and_corp_tokens_are_rejected() {
        let c = classifier();
        assert!(!c.is_plausible_asset_label("Indications"));
        assert!(!c.is_plausible_asset_label("Acme Therapeutics Inc"));
        assert!(!c.is_plausible_asset_label("actorXIa"));
        assert!(!c.is_plausible_asset_label("Undisclosed"));
    }

    #[test]
    fn word_cap_exempts_program_codes() {
        let c = classifier();
        assert!(!c.is_plausible_asset_label("one two three four five six seven"));
        assert!(c.is_plausible_asset_label("JNJ-4496 a b c d e f"));
    }

    #[test]
    fn indication_text_cut_at_disclaimer() {
        let c = classifier();
        let text = "2L+ metastatic NSCLC through clinical trials and otherwise";
        assert_eq!(c.sanitize_indication_text(text), "2L+ metastatic NSCLC");
        assert_eq!(c.sanitize_indication_text("*This is not a forecast"), "");
    }

    #[test]
    fn indication_text_is_deglued() {
        let c = classifier();
        assert_eq!(
            c.sanitize_indication_text("metastaticNSCLCTreatment"),
            "metastatic NSCLC Treatment"
        );
    }
}
