//! Threshold matching of a probe embedding against the enrollment index.

use crate::index::IndexSnapshot;
use crate::types::{Embedding, UserId};

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Best cosine similarity seen, in [-1, 1]; 0.0 for an empty gallery.
    pub similarity: f32,
    /// Matched identity, only when `matched`.
    pub identity: Option<UserId>,
}

impl MatchResult {
    fn no_match(similarity: f32) -> Self {
        Self {
            matched: false,
            similarity,
            identity: None,
        }
    }
}

/// Strategy for comparing a probe against enrolled faces.
pub trait Matcher {
    /// 1-to-N: best identity whose similarity clears the threshold.
    fn identify(&self, probe: &Embedding, gallery: &IndexSnapshot) -> MatchResult;

    /// 1-to-1: compare only against `claimed`. Unknown identities never match.
    fn verify(&self, probe: &Embedding, claimed: UserId, gallery: &IndexSnapshot) -> MatchResult;
}

/// Cosine similarity matcher with a strict `>` threshold.
///
/// Identification always visits every gallery entry. Equal similarities
/// resolve to the lowest user id.
#[derive(Debug, Clone, Copy)]
pub struct CosineMatcher {
    threshold: f32,
}

impl CosineMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl Matcher for CosineMatcher {
    fn identify(&self, probe: &Embedding, gallery: &IndexSnapshot) -> MatchResult {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best: Option<UserId> = None;

        for (user, enrolled) in gallery.iter() {
            let sim = probe.similarity(enrolled);
            if sim > best_sim || (sim == best_sim && best.is_some_and(|b| user < b)) {
                best_sim = sim;
                best = Some(user);
            }
        }

        match best {
            Some(user) if best_sim > self.threshold => MatchResult {
                matched: true,
                similarity: best_sim,
                identity: Some(user),
            },
            Some(_) => MatchResult::no_match(best_sim),
            None => MatchResult::no_match(0.0),
        }
    }

    fn verify(&self, probe: &Embedding, claimed: UserId, gallery: &IndexSnapshot) -> MatchResult {
        let Some(enrolled) = gallery.get(claimed) else {
            return MatchResult::no_match(0.0);
        };

        let sim = probe.similarity(enrolled);
        if sim > self.threshold {
            MatchResult {
                matched: true,
                similarity: sim,
                identity: Some(claimed),
            }
        } else {
            MatchResult::no_match(sim)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::from_raw(values.to_vec()).unwrap()
    }

    fn gallery(entries: &[(i64, &[f32])]) -> IndexSnapshot {
        IndexSnapshot::from_entries(entries.iter().map(|(u, v)| (UserId(*u), emb(v))))
    }

    /// Unit vector whose similarity with [1, 0] is exactly `cos`.
    fn at_cos(cos: f32) -> Embedding {
        emb(&[cos, (1.0 - cos * cos).sqrt()])
    }

    #[test]
    fn test_identify_empty_gallery() {
        let result = CosineMatcher::new(0.8).identify(&emb(&[1.0, 0.0]), &IndexSnapshot::default());
        assert!(!result.matched);
        assert_eq!(result.identity, None);
        assert_eq!(result.similarity, 0.0);

        // Even a permissive threshold cannot match nothing.
        let result = CosineMatcher::new(-1.0).identify(&emb(&[1.0, 0.0]), &IndexSnapshot::default());
        assert!(!result.matched);
    }

    #[test]
    fn test_identify_picks_best_of_all_entries() {
        let g = gallery(&[
            (1, &[0.0, 1.0, 0.0]),
            (2, &[0.0, 0.0, 1.0]),
            (3, &[1.0, 0.05, 0.0]),
            (4, &[1.0, 0.5, 0.0]),
        ]);
        let result = CosineMatcher::new(0.8).identify(&emb(&[1.0, 0.0, 0.0]), &g);
        assert!(result.matched);
        assert_eq!(result.identity, Some(UserId(3)));
        assert!(result.similarity > 0.99);
    }

    #[test]
    fn test_identify_below_threshold() {
        let g = gallery(&[(1, &[0.0, 1.0])]);
        let result = CosineMatcher::new(0.8).identify(&emb(&[1.0, 0.0]), &g);
        assert!(!result.matched);
        assert_eq!(result.identity, None);
        assert!(result.similarity.abs() < 1e-6);
    }

    #[test]
    fn test_identify_equal_to_threshold_is_no_match() {
        let probe = emb(&[1.0, 0.0]);
        let enrolled = at_cos(0.6);
        let sim = probe.similarity(&enrolled);
        let g = IndexSnapshot::from_entries([(UserId(1), enrolled)]);

        let result = CosineMatcher::new(sim).identify(&probe, &g);
        assert!(!result.matched);
        assert_eq!(result.identity, None);

        let result = CosineMatcher::new(sim - 1e-4).identify(&probe, &g);
        assert_eq!(result.identity, Some(UserId(1)));
    }

    #[test]
    fn test_identify_tie_prefers_lowest_user() {
        let g = gallery(&[(30, &[1.0, 0.0]), (4, &[1.0, 0.0]), (17, &[1.0, 0.0])]);
        let result = CosineMatcher::new(0.8).identify(&emb(&[1.0, 0.0]), &g);
        assert_eq!(result.identity, Some(UserId(4)));
    }

    #[test]
    fn test_identify_self_match() {
        let e = emb(&[0.2, -0.4, 0.9, 0.1]);
        let g = IndexSnapshot::from_entries([(UserId(9), e.clone())]);
        assert_eq!(CosineMatcher::new(0.8).identify(&e, &g).identity, Some(UserId(9)));
    }

    #[test]
    fn test_verify_unknown_identity() {
        let g = gallery(&[(1, &[1.0, 0.0])]);
        let result = CosineMatcher::new(0.8).verify(&emb(&[1.0, 0.0]), UserId(2), &g);
        assert!(!result.matched);
        assert_eq!(result.identity, None);
    }

    #[test]
    fn test_verify_only_compares_claimed_identity() {
        // Probe is identical to user 1 but the claim is for user 2.
        let g = gallery(&[(1, &[1.0, 0.0]), (2, &[0.0, 1.0])]);
        let probe = emb(&[1.0, 0.0]);
        let m = CosineMatcher::new(0.8);
        assert!(!m.verify(&probe, UserId(2), &g).matched);
        assert!(m.verify(&probe, UserId(1), &g).matched);
    }

    #[test]
    fn test_verify_strict_threshold() {
        let probe = emb(&[1.0, 0.0]);
        let enrolled = at_cos(0.9);
        let sim = probe.similarity(&enrolled);
        let g = IndexSnapshot::from_entries([(UserId(5), enrolled)]);
        assert!(!CosineMatcher::new(sim).verify(&probe, UserId(5), &g).matched);
        assert!(CosineMatcher::new(sim - 1e-4).verify(&probe, UserId(5), &g).matched);
    }

    #[test]
    fn test_dimension_mismatch_never_matches() {
        let g = gallery(&[(1, &[1.0, 0.0, 0.0])]);
        let probe = emb(&[1.0, 0.0]);
        let m = CosineMatcher::new(0.0);
        assert!(!m.identify(&probe, &g).matched);
        assert!(!m.verify(&probe, UserId(1), &g).matched);
    }
}
