//! Matching the aliases the service reports as loaded against the aliases it
//! lists as available. The two reports format names slightly differently, so
//! exact comparison alone misses real matches.

use crate::config::AliasMatching;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    Exact,
    /// The only loaded alias, unknown to the available list, taken as-is.
    SoleLoaded,
    Substring,
    Affix,
    EditDistance(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasMatch {
    /// The alias to select (from the available list, or the injected loaded one).
    pub alias: String,
    pub rule: MatchRule,
}

/// Classic dynamic-programming edit distance over chars.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

fn substring_match(a: &str, b: &str, th: &AliasMatching) -> bool {
    let (shorter, longer) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    shorter.len() > th.min_substring_len && longer.contains(shorter)
}

fn affix_match(a: &str, b: &str) -> bool {
    !a.is_empty()
        && !b.is_empty()
        && (a.starts_with(b) || b.starts_with(a) || a.ends_with(b) || b.ends_with(a))
}

/// Fuzzy rules (substring, affix, edit distance) over every loaded x available
/// pair, in rule order. Returns the available alias that matched.
fn fuzzy_match(available: &[String], loaded: &[String], th: &AliasMatching) -> Option<AliasMatch> {
    let avail: Vec<String> = available.iter().map(|a| a.to_ascii_lowercase()).collect();
    let load: Vec<String> = loaded.iter().map(|l| l.to_ascii_lowercase()).collect();

    for l in &load {
        if let Some(i) = avail.iter().position(|a| substring_match(a, l, th)) {
            return Some(AliasMatch {
                alias: available[i].clone(),
                rule: MatchRule::Substring,
            });
        }
    }

    for l in &load {
        if let Some(i) = avail.iter().position(|a| affix_match(a, l)) {
            return Some(AliasMatch {
                alias: available[i].clone(),
                rule: MatchRule::Affix,
            });
        }
    }

    let mut best: Option<(usize, usize)> = None;
    for l in &load {
        for (i, a) in avail.iter().enumerate() {
            let d = edit_distance(a, l);
            if best.map_or(true, |(bd, _)| d < bd) {
                best = Some((d, i));
            }
        }
    }
    match best {
        Some((d, i)) if d <= th.max_edit_distance => Some(AliasMatch {
            alias: available[i].clone(),
            rule: MatchRule::EditDistance(d),
        }),
        _ => None,
    }
}

fn exact_match(available: &[String], loaded: &[String]) -> Option<AliasMatch> {
    loaded.iter().find_map(|l| {
        available
            .iter()
            .find(|a| a.eq_ignore_ascii_case(l))
            .map(|a| AliasMatch {
                alias: a.clone(),
                rule: MatchRule::Exact,
            })
    })
}

/// Pick the model to select from what is loaded, first rule that succeeds:
/// exact, sole-loaded, substring, affix, edit distance.
///
/// A sole loaded alias only counts as unknown to `available` when none of the
/// fuzzy rules relates it to an available alias; in that case it is appended
/// to `available`.
pub fn reconcile(
    available: &mut Vec<String>,
    loaded: &[String],
    th: &AliasMatching,
) -> Option<AliasMatch> {
    if loaded.is_empty() {
        return None;
    }
    if let Some(m) = exact_match(available, loaded) {
        return Some(m);
    }

    let fuzzy = fuzzy_match(available, loaded, th);
    if loaded.len() == 1 && fuzzy.is_none() {
        let sole = loaded[0].clone();
        available.push(sole.clone());
        return Some(AliasMatch {
            alias: sole,
            rule: MatchRule::SoleLoaded,
        });
    }
    fuzzy
}

/// Whether `requested` shows up in `loaded`, exactly or by a fuzzy rule.
/// Returns the loaded entry that matched.
pub fn find_loaded<'a>(requested: &str, loaded: &'a [String], th: &AliasMatching) -> Option<&'a str> {
    if let Some(l) = loaded.iter().find(|l| l.eq_ignore_ascii_case(requested)) {
        return Some(l);
    }
    // Swap roles: each loaded alias is a candidate for the single requested one.
    for candidate in loaded {
        let single = [requested.to_string()];
        if fuzzy_match(&single, std::slice::from_ref(candidate), th).is_some() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("gpt-oss-20b", "gtp-oss-20b"), 2);
        assert_eq!(edit_distance("phi-4", "phi-4"), 0);
    }

    #[test]
    fn test_exact_case_insensitive() {
        let mut available = strings(&["Phi-4-Mini", "qwen2.5"]);
        let m = reconcile(&mut available, &strings(&["phi-4-mini"]), &AliasMatching::default()).unwrap();
        assert_eq!(m.alias, "Phi-4-Mini");
        assert_eq!(m.rule, MatchRule::Exact);
    }

    #[test]
    fn test_substring_beats_sole_loaded() {
        let mut available = strings(&["phi-4-mini-instruct", "qwen2.5"]);
        let m = reconcile(&mut available, &strings(&["phi-4-mini"]), &AliasMatching::default()).unwrap();
        assert_eq!(m.alias, "phi-4-mini-instruct");
        assert_eq!(m.rule, MatchRule::Substring);
        assert_eq!(available.len(), 2);
    }

    #[test]
    fn test_edit_distance_fallback() {
        let mut available = strings(&["gpt-oss-20b"]);
        let m = reconcile(&mut available, &strings(&["gtp-oss-20b"]), &AliasMatching::default()).unwrap();
        assert_eq!(m.alias, "gpt-oss-20b");
        assert_eq!(m.rule, MatchRule::EditDistance(2));
    }

    #[test]
    fn test_sole_loaded_is_injected() {
        let mut available = strings(&["qwen2.5-0.5b", "mistral-7b"]);
        let m = reconcile(&mut available, &strings(&["deepseek-r1-7b"]), &AliasMatching::default()).unwrap();
        assert_eq!(m.alias, "deepseek-r1-7b");
        assert_eq!(m.rule, MatchRule::SoleLoaded);
        assert_eq!(available.last().map(String::as_str), Some("deepseek-r1-7b"));
    }

    #[test]
    fn test_short_tokens_do_not_substring_match() {
        // "phi-4" is only 5 chars, so containment is not enough; the prefix rule still applies.
        let mut available = strings(&["phi-4-reasoning"]);
        let loaded = strings(&["phi-4", "other-model-x"]);
        let m = reconcile(&mut available, &loaded, &AliasMatching::default()).unwrap();
        assert_eq!(m.rule, MatchRule::Affix);
    }

    #[test]
    fn test_no_match_with_many_loaded() {
        let mut available = strings(&["qwen2.5"]);
        let loaded = strings(&["deepseek-r1-7b", "mistral-7b-v0.2"]);
        assert!(reconcile(&mut available, &loaded, &AliasMatching::default()).is_none());
        assert!(reconcile(&mut available, &[], &AliasMatching::default()).is_none());
    }

    #[test]
    fn test_thresholds_are_configurable() {
        let strict = AliasMatching { max_edit_distance: 1, min_substring_len: 5 };
        let mut available = strings(&["gpt-oss-20b", "qwen2.5"]);
        let loaded = strings(&["gtp-oss-20b", "zzz"]);
        assert!(reconcile(&mut available, &loaded, &strict).is_none());

        let loose = AliasMatching { max_edit_distance: 3, min_substring_len: 20 };
        let mut available = strings(&["phi-4-mini-instruct"]);
        let m = reconcile(&mut available, &strings(&["mini-instruct-x", "y"]), &loose);
        assert!(m.is_none());
    }

    #[test]
    fn test_find_loaded() {
        let th = AliasMatching::default();
        let loaded = strings(&["Phi-4-mini-instruct", "qwen2.5-0.5b"]);
        assert_eq!(find_loaded("qwen2.5-0.5b", &loaded, &th), Some("qwen2.5-0.5b"));
        assert_eq!(find_loaded("phi-4-mini", &loaded, &th), Some("Phi-4-mini-instruct"));
        assert_eq!(find_loaded("mistral-7b", &loaded, &th), None);
    }
}
