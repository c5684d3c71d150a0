//! Canonical string keys and alias splitting for asset labels.

/// Lower-cased, punctuation-stripped key used for equality and dedup.
/// Idempotent: `norm_text(norm_text(s)) == norm_text(s)`.
pub fn norm_text(s: &str) -> String {
    let lowered = s.trim().to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_space = false;
    for ch in lowered.chars() {
        if ch.is_whitespace() {
            if !last_space && !out.is_empty() {
                out.push(' ');
                last_space = true;
            }
            continue;
        }
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '-' | '+' | '.' | '/') {
            out.push(ch);
            last_space = false;
        }
    }
    out.trim().to_string()
}

/// Split a composite asset label into a canonical name plus alias terms.
///
/// - `"BRAND (generic)"` -> canonical `BRAND`, aliases include both.
/// - `"JNJ-1900 (NBTXR3)"` -> canonical `JNJ-1900`, aliases include `NBTXR3`.
/// - `"TALVEY + TECVAYLI"` -> canonical is the full label, aliases add both parts.
pub fn split_asset_aliases(asset_label: &str) -> (String, Vec<String>) {
    let label = asset_label.trim().to_string();
    let mut aliases: Vec<String> = vec![label.clone()];

    // Combo separators add *additional* terms; the full label stays an alias.
    let mut combo_parts: Vec<String> = vec![label.clone()];
    for sep in ['+', '/', ';'] {
        if !label.contains(sep) {
            continue;
        }
        let mut next_parts = Vec::new();
        for part in &combo_parts {
            if part.contains(sep) {
                next_parts.extend(
                    part.split(sep)
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(ToOwned::to_owned),
                );
            } else {
                next_parts.push(part.clone());
            }
        }
        combo_parts = next_parts;
    }
    for part in combo_parts {
        if !aliases.contains(&part) {
            aliases.push(part);
        }
    }

    if let Some((outer, inner)) = trailing_parenthetical(&label) {
        let canonical = if outer.is_empty() {
            label.clone()
        } else {
            outer.to_string()
        };
        for part in inner.split([';', '/', ',']) {
            let part = part.trim();
            if !part.is_empty() {
                aliases.push(part.to_string());
            }
        }
        if !outer.is_empty() && !aliases.iter().any(|a| a == outer) {
            aliases.push(outer.to_string());
        }
        return (canonical, dedupe_preserve(aliases));
    }

    (label, dedupe_preserve(aliases))
}

/// `"X (Y)"` -> `("X", "Y")` when the label ends with a parenthetical.
fn trailing_parenthetical(label: &str) -> Option<(&str, &str)> {
    let trimmed = label.trim_end();
    if !trimmed.ends_with(')') {
        return None;
    }
    let open = trimmed.find('(')?;
    let inner = &trimmed[open + 1..trimmed.len() - 1];
    Some((trimmed[..open].trim(), inner.trim()))
}

/// Order-preserving dedup keyed by `norm_text`.
pub fn dedupe_preserve(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for item in items {
        let key = norm_text(&item);
        if seen.insert(key) {
            out.push(item);
        }
    }
    out
}
