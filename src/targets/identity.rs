//! Identity normalization and fuzzy comparison.
//!
//! The canonical identity of a target is the normalized
//! (organization, role) pair: case-folded, punctuation stripped, corporate
//! suffixes removed. Exact identity matches merge; anything short of exact
//! is only ever *reported* as similar, never merged automatically.

/// Corporate suffixes dropped from the end of organization names.
/// Checked token-wise after punctuation stripping, repeatedly, so
/// "Acme Holdings Co Ltd" reduces to "acme holdings".
const CORP_SUFFIXES: &[&str] = &[
    "inc", "incorporated", "llc", "llp", "ltd", "limited", "corp", "co",
    "gmbh", "ag", "sa", "bv", "plc", "pty", "oy", "ab", "kk", "srl",
];

/// Normalize an organization name to its canonical identity form.
pub fn normalize_org(raw: &str) -> String {
    let mut tokens = tokenize(raw);
    while let Some(last) = tokens.last() {
        if CORP_SUFFIXES.contains(&last.as_str()) {
            tokens.pop();
        } else {
            break;
        }
    }
    tokens.join(" ")
}

/// Normalize a role title. Same folding as organizations, but corporate
/// suffixes stay ("co" in "co-founder" is already split off by tokenize,
/// yet role words should never be dropped).
pub fn normalize_role(raw: &str) -> String {
    tokenize(raw).join(" ")
}

/// Lowercase, strip punctuation, split into word tokens.
fn tokenize(raw: &str) -> Vec<String> {
    raw.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Token-set similarity between two normalized names, in `[0.0, 1.0]`.
///
/// Jaccard over word tokens, with a prefix tolerance so abbreviated forms
/// ("corp" / "corporation", "eng" is too short) count as the same token.
pub fn token_similarity(a: &str, b: &str) -> f64 {
    let tokens_a: Vec<&str> = a.split_whitespace().collect();
    let tokens_b: Vec<&str> = b.split_whitespace().collect();

    if tokens_a.is_empty() && tokens_b.is_empty() {
        return 1.0;
    }
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let mut used_b = vec![false; tokens_b.len()];
    let mut matched = 0usize;

    for ta in &tokens_a {
        for (i, tb) in tokens_b.iter().enumerate() {
            if !used_b[i] && tokens_match(ta, tb) {
                used_b[i] = true;
                matched += 1;
                break;
            }
        }
    }

    let union = tokens_a.len() + tokens_b.len() - matched;
    matched as f64 / union as f64
}

/// Two tokens match if equal, or if one is a prefix of the other and the
/// shorter side is at least four characters ("corp"/"corporation" yes,
/// "co"/"corporation" no).
fn tokens_match(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    short.len() >= 4 && long.starts_with(short)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_case_and_punctuation() {
        assert_eq!(normalize_org("ACME Corp., Inc."), "acme");
        assert_eq!(normalize_org("Acme Corp"), "acme");
        assert_eq!(normalize_org("acme"), "acme");
    }

    #[test]
    fn normalize_strips_stacked_suffixes() {
        assert_eq!(normalize_org("Acme Holdings Co., Ltd."), "acme holdings");
        assert_eq!(normalize_org("Müller GmbH"), "müller");
    }

    #[test]
    fn normalize_keeps_inner_words() {
        // "Co" only drops from the end
        assert_eq!(normalize_org("Co-operative Bank Plc"), "co operative bank");
    }

    #[test]
    fn normalize_role_keeps_all_words() {
        assert_eq!(
            normalize_role("Senior Backend-Engineer (Rust)"),
            "senior backend engineer rust"
        );
    }

    #[test]
    fn identical_identities_collapse() {
        // The exact scenario that must merge: same org modulo case,
        // punctuation, and a corporate suffix.
        assert_eq!(normalize_org("Acme Corp"), normalize_org("ACME Corp., Inc."));
    }

    #[test]
    fn similarity_exact() {
        assert_eq!(token_similarity("acme widgets", "acme widgets"), 1.0);
    }

    #[test]
    fn similarity_disjoint() {
        assert_eq!(token_similarity("acme", "globex"), 0.0);
    }

    #[test]
    fn similarity_prefix_tolerant() {
        // "corporation" vs "corp" count as one token
        let s = token_similarity("acme corporation", "acme corp");
        assert_eq!(s, 1.0);
    }

    #[test]
    fn similarity_partial_overlap() {
        let s = token_similarity("acme widget labs", "acme widget");
        assert!(s > 0.6 && s < 0.7, "got {s}");
    }

    #[test]
    fn short_prefixes_do_not_match() {
        assert!(!tokens_match("co", "corporation"));
        assert!(tokens_match("corp", "corporation"));
    }

    #[test]
    fn similarity_empty_inputs() {
        assert_eq!(token_similarity("", ""), 1.0);
        assert_eq!(token_similarity("acme", ""), 0.0);
    }
}
