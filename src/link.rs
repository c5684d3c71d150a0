//! Matching trial intervention strings against the company alias index.
//!
//! Exact lookup first, then a bounded fuzzy pass; one winner per asset with
//! exact rank beating fuzzy and higher score breaking ties. The link set for
//! a trial is always rebuilt wholesale by the caller.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::normalize::norm_text;
use crate::sanitize::{self, Lexicon};
use crate::store::{MatchKind, ResolvedLink};

/// 0-100 similarity: the better of a token-set ratio and a partial-overlap
/// ratio, both built on normalized Levenshtein distance.
pub fn similarity(a: &str, b: &str) -> u32 {
    token_set_ratio(a, b).max(partial_ratio(a, b))
}

fn ratio(a: &str, b: &str) -> u32 {
    if a.is_empty() && b.is_empty() {
        return 100;
    }
    (strsim::normalized_levenshtein(a, b) * 100.0).round() as u32
}

/// Word-order and duplication insensitive comparison.
fn token_set_ratio(a: &str, b: &str) -> u32 {
    let set_a: BTreeSet<&str> = a.split_whitespace().collect();
    let set_b: BTreeSet<&str> = b.split_whitespace().collect();
    if set_a.is_empty() || set_b.is_empty() {
        return 0;
    }

    let common: Vec<&str> = set_a.intersection(&set_b).copied().collect();
    let only_a: Vec<&str> = set_a.difference(&set_b).copied().collect();
    let only_b: Vec<&str> = set_b.difference(&set_a).copied().collect();

    let base = common.join(" ");
    let with_a = join_nonempty(&base, &only_a.join(" "));
    let with_b = join_nonempty(&base, &only_b.join(" "));

    ratio(&with_a, &with_b)
        .max(ratio(&base, &with_a))
        .max(ratio(&base, &with_b))
}

fn join_nonempty(left: &str, right: &str) -> String {
    match (left.is_empty(), right.is_empty()) {
        (true, _) => right.to_string(),
        (_, true) => left.to_string(),
        _ => format!("{left} {right}"),
    }
}

/// Best alignment of the shorter string against same-length windows of the
/// longer one.
fn partial_ratio(a: &str, b: &str) -> u32 {
    let (short, long) = if a.chars().count() <= b.chars().count() {
        (a, b)
    } else {
        (b, a)
    };
    let short_len = short.chars().count();
    let long_chars: Vec<char> = long.chars().collect();
    if short_len == 0 {
        return 0;
    }
    if short_len == long_chars.len() {
        return ratio(short, long);
    }

    let mut best = 0;
    for start in 0..=(long_chars.len() - short_len) {
        let window: String = long_chars[start..start + short_len].iter().collect();
        best = best.max(ratio(short, &window));
        if best == 100 {
            break;
        }
    }
    best
}

/// One intervention as reported by the registry.
#[derive(Debug, Clone, Default)]
pub struct Intervention {
    pub name: String,
    pub kind: Option<String>,
    /// Alternate/brand names listed alongside the primary name.
    pub other_names: Vec<String>,
}

/// Normalized candidate terms for one intervention: dosage/route noise and
/// parenthetical qualifiers stripped, combination regimens split apart, and
/// every listed alternate name considered on its own. Original casing is
/// preserved so the bootstrap filter can still see brand shapes like
/// `RYBREVANT`; matching normalizes on its own.
pub fn candidate_terms(intervention: &Intervention, lexicon: &Lexicon) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut push = |term: String| {
        if term.len() >= 3 && seen.insert(norm_text(&term)) {
            out.push(term);
        }
    };

    for raw in std::iter::once(intervention.name.as_str())
        .chain(intervention.other_names.iter().map(String::as_str))
    {
        for part in split_regimen(raw) {
            let cleaned = strip_noise(&part, lexicon);
            if !cleaned.is_empty() {
                push(cleaned);
            }
        }
    }
    out
}

fn split_regimen(raw: &str) -> Vec<String> {
    let no_parens = strip_parentheticals(raw);
    let mut parts = vec![no_parens];
    for sep in ['+', '/', ';'] {
        parts = parts
            .iter()
            .flat_map(|p| p.split(sep).map(str::trim).map(ToOwned::to_owned))
            .collect();
    }
    for word_sep in [" and ", " with "] {
        parts = parts
            .iter()
            .flat_map(|p| split_word_insensitive(p, word_sep))
            .collect();
    }
    parts.retain(|p| !p.is_empty());
    parts
}

/// Case-insensitive split on a word separator that keeps the original
/// casing of the pieces.
fn split_word_insensitive(text: &str, sep: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    if lowered.len() != text.len() {
        // Non-ASCII case folding shifted byte offsets; split as-is.
        return text.split(sep).map(|p| p.trim().to_string()).collect();
    }
    let mut out = Vec::new();
    let mut start = 0;
    for (idx, _) in lowered.match_indices(sep) {
        if idx >= start {
            out.push(text[start..idx].trim().to_string());
            start = idx + sep.len();
        }
    }
    out.push(text[start..].trim().to_string());
    out
}

fn strip_parentheticals(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut depth = 0usize;
    for ch in raw.chars() {
        match ch {
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(ch),
            _ => {}
        }
    }
    out
}

/// Drop dosage and route tokens, keeping the survivors' original casing.
/// The character set matches `norm_text`; only the lowercasing is deferred.
fn strip_noise(part: &str, lexicon: &Lexicon) -> String {
    let kept: Vec<String> = part
        .split_whitespace()
        .filter_map(|raw| {
            let token: String = raw
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '+' | '.' | '/'))
                .collect();
            if token.is_empty() {
                return None;
            }
            if token.chars().all(|c| c.is_ascii_digit() || c == '.' || c == '/') {
                return None;
            }
            // "100mg", "5ml" style dosage tokens.
            if token.chars().next().is_some_and(|c| c.is_ascii_digit())
                && token.chars().any(|c| c.is_ascii_alphabetic())
            {
                return None;
            }
            let low = token.to_lowercase();
            if lexicon.intervention_noise.iter().any(|noise| *noise == low) {
                return None;
            }
            Some(token)
        })
        .collect();
    kept.join(" ")
}

pub struct Linker<'a> {
    /// alias_norm -> asset id, the company-wide index.
    alias_index: HashMap<String, i64>,
    lexicon: &'a Lexicon,
    fuzzy_threshold: u32,
    /// Fuzzy comparison skips aliases with a larger length delta.
    max_len_delta: usize,
}

impl<'a> Linker<'a> {
    pub fn new(alias_index: Vec<(String, i64)>, lexicon: &'a Lexicon, fuzzy_threshold: u32) -> Self {
        Self {
            alias_index: alias_index.into_iter().collect(),
            lexicon,
            fuzzy_threshold,
            max_len_delta: 10,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.alias_index.is_empty()
    }

    /// Resolve one winner per asset across all of a trial's interventions.
    pub fn resolve(&self, interventions: &[Intervention]) -> Vec<ResolvedLink> {
        let mut best_for_asset: BTreeMap<i64, (MatchKind, u32)> = BTreeMap::new();

        for intervention in interventions {
            for term in candidate_terms(intervention, self.lexicon) {
                match self.match_term(&term) {
                    Some((asset_id, kind, score)) => {
                        best_for_asset
                            .entry(asset_id)
                            .and_modify(|current| *current = choose_better(*current, (kind, score)))
                            .or_insert((kind, score));
                    }
                    None => continue,
                }
            }
        }

        best_for_asset
            .into_iter()
            .map(|(asset_id, (kind, score))| ResolvedLink { asset_id, kind, score })
            .collect()
    }

    /// Exact alias hit, else the best fuzzy alias above threshold.
    pub fn match_term(&self, term: &str) -> Option<(i64, MatchKind, u32)> {
        let normed = norm_text(term);
        if normed.is_empty() {
            return None;
        }
        if let Some(&asset_id) = self.alias_index.get(&normed) {
            return Some((asset_id, MatchKind::Exact, 100));
        }

        let mut best: Option<(i64, u32)> = None;
        for (alias_norm, &asset_id) in &self.alias_index {
            if alias_norm.len().abs_diff(normed.len()) > self.max_len_delta {
                continue;
            }
            let score = similarity(&normed, alias_norm);
            if score < self.fuzzy_threshold {
                continue;
            }
            best = match best {
                Some((_, current)) if current >= score => best,
                _ => Some((asset_id, score)),
            };
        }
        best.map(|(asset_id, score)| (asset_id, MatchKind::Fuzzy, score))
    }
}

fn choose_better(existing: (MatchKind, u32), candidate: (MatchKind, u32)) -> (MatchKind, u32) {
    if candidate.0.rank() != existing.0.rank() {
        if candidate.0.rank() > existing.0.rank() { candidate } else { existing }
    } else if candidate.1 > existing.1 {
        candidate
    } else {
        existing
    }
}

/// Conservative filter for promoting an intervention term into an alias set.
pub fn looks_drug_like(term: &str, lexicon: &Lexicon) -> bool {
    let trimmed = term.trim();
    if trimmed.is_empty() {
        return false;
    }
    let low = trimmed.to_lowercase();
    if lexicon.placeholders.iter().any(|p| *p == low)
        || lexicon.stop_asset_exact.iter().any(|s| *s == low)
    {
        return false;
    }

    if sanitize::is_program_code(trimmed) {
        return true;
    }
    if let Some(last) = low.split_whitespace().next_back()
        && lexicon.drug_suffixes.iter().any(|sfx| last.ends_with(sfx.as_str()))
        && last.len() > 5
    {
        return true;
    }
    // Short ALL-CAPS brand shape ("TALVEY").
    if !trimmed.contains(' ')
        && (3..=10).contains(&trimmed.len())
        && trimmed.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        && trimmed.chars().any(|c| c.is_ascii_uppercase())
    {
        return true;
    }
    false
}

/// Counts how many distinct trials each candidate term showed up in while
/// one query alias was being processed. A single-trial occurrence is never
/// enough to mutate the alias set.
#[derive(Debug, Default)]
pub struct BootstrapTracker {
    trials_by_term: HashMap<String, BTreeSet<i64>>,
    display: HashMap<String, String>,
}

impl BootstrapTracker {
    pub fn observe(&mut self, term: &str, trial_id: i64) {
        let key = norm_text(term);
        if key.is_empty() {
            return;
        }
        self.trials_by_term.entry(key.clone()).or_default().insert(trial_id);
        self.display.entry(key).or_insert_with(|| term.trim().to_string());
    }

    /// Terms seen across at least `min_trials` distinct trials that pass the
    /// drug-likeness filter, in deterministic order.
    pub fn promotable(&self, min_trials: usize, lexicon: &Lexicon) -> Vec<String> {
        let mut out: Vec<String> = self
            .trials_by_term
            .iter()
            .filter(|(_, trials)| trials.len() >= min_trials)
            .filter_map(|(key, _)| self.display.get(key))
            .filter(|term| looks_drug_like(term, lexicon))
            .cloned()
            .collect();
        out.sort();
        out
    }
}
