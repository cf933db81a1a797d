//! The URL-overlap heuristic shared by the reconciler and the restore
//! registry (spec §4.7's Strategy B and the window-ownership validation
//! rule).

use std::collections::HashSet;

/// `|a ∩ b| / max(|a|, |b|)`, treating both slices as sets of URLs.
/// Two empty slices are defined as a perfect, degenerate match (`1.0`)
/// to keep callers from special-casing empty windows.
pub fn overlap_ratio(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let set_a: HashSet<&String> = a.iter().collect();
    let set_b: HashSet<&String> = b.iter().collect();
    let intersection = set_a.intersection(&set_b).count();
    let denom = set_a.len().max(set_b.len());
    if denom == 0 {
        0.0
    } else {
        intersection as f64 / denom as f64
    }
}

/// Candidate considered for matching against an observed set of URLs.
pub struct Candidate<'a, T> {
    pub key: &'a str,
    pub urls: &'a [String],
    pub threshold: f64,
    pub item: T,
}

/// Picks the candidate with the highest overlap ratio at or above its own
/// threshold. Ties break on score first, then lexicographic `key`, per
/// spec §4.7 Strategy B.
pub fn best_match<'a, T>(current_urls: &[String], candidates: Vec<Candidate<'a, T>>) -> Option<(T, f64)> {
    let mut best: Option<(Candidate<'a, T>, f64)> = None;
    for candidate in candidates {
        let score = overlap_ratio(current_urls, candidate.urls);
        if score < candidate.threshold {
            continue;
        }
        let better = match &best {
            None => true,
            Some((best_candidate, best_score)) => {
                score > *best_score || (score == *best_score && candidate.key < best_candidate.key)
            }
        };
        if better {
            best = Some((candidate, score));
        }
    }
    best.map(|(candidate, score)| (candidate.item, score))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn identical_sets_score_one() {
        let a = urls(&["https://a", "https://b"]);
        assert_eq!(overlap_ratio(&a, &a), 1.0);
    }

    #[test]
    fn disjoint_sets_score_zero() {
        let a = urls(&["https://a"]);
        let b = urls(&["https://b"]);
        assert_eq!(overlap_ratio(&a, &b), 0.0);
    }

    #[test]
    fn partial_overlap_uses_max_denominator() {
        let a = urls(&["https://a", "https://b", "https://c"]);
        let b = urls(&["https://a", "https://b"]);
        assert!((overlap_ratio(&a, &b) - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn both_empty_is_perfect_match() {
        assert_eq!(overlap_ratio(&[], &[]), 1.0);
    }

    #[test]
    fn best_match_prefers_higher_score_then_lexicographic_key() {
        let current = urls(&["https://a", "https://b"]);
        let zzz_urls = urls(&["https://a"]);
        let aaa_urls = urls(&["https://a", "https://b"]);
        let candidates = vec![
            Candidate {
                key: "zzz",
                urls: &zzz_urls,
                threshold: 0.3,
                item: "zzz",
            },
            Candidate {
                key: "aaa",
                urls: &aaa_urls,
                threshold: 0.3,
                item: "aaa",
            },
        ];
        let (winner, score) = best_match(&current, candidates).unwrap();
        assert_eq!(winner, "aaa");
        assert_eq!(score, 1.0);
    }

    #[test]
    fn below_threshold_is_excluded() {
        let current = urls(&["https://a"]);
        let candidate_urls = urls(&["https://z", "https://y", "https://x"]);
        let candidates = vec![Candidate {
            key: "k",
            urls: &candidate_urls,
            threshold: 0.5,
            item: "k",
        }];
        assert!(best_match(&current, candidates).is_none());
    }
}
