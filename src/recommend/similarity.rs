//! Content-based similarity between a seed and candidate novels.

use std::cmp::Ordering;
use std::collections::HashSet;

pub const CATEGORY_WEIGHT: f64 = 0.5;
pub const KEYWORD_WEIGHT: f64 = 0.3;
pub const AUTHOR_WEIGHT: f64 = 0.2;

/// Days over which freshness halves.
pub const FRESHNESS_DAYS: f64 = 30.0;

/// Category ids, keyword ids and author names of a novel or a reader profile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Features {
    pub categories: HashSet<i64>,
    pub keywords: HashSet<i64>,
    pub authors: HashSet<String>,
}

impl Features {
    pub fn new(
        categories: impl IntoIterator<Item = i64>,
        keywords: impl IntoIterator<Item = i64>,
        author: &str,
    ) -> Self {
        let mut features = Self {
            categories: categories.into_iter().collect(),
            keywords: keywords.into_iter().collect(),
            authors: HashSet::new(),
        };
        features.add_author(author);
        features
    }

    /// Empty author names never take part in matching.
    pub fn add_author(&mut self, author: &str) {
        let author = author.trim();
        if !author.is_empty() {
            self.authors.insert(author.to_string());
        }
    }

    pub fn merge(&mut self, other: Features) {
        self.categories.extend(other.categories);
        self.keywords.extend(other.keywords);
        self.authors.extend(other.authors);
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty() && self.keywords.is_empty() && self.authors.is_empty()
    }
}

/// `|A ∩ B| / |A ∪ B|`, with two empty sets scoring 0.
pub fn jaccard<T: Eq + std::hash::Hash>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Weighted blend of category overlap, keyword overlap and a shared author.
pub fn similarity(seed: &Features, candidate: &Features) -> f64 {
    let same_author = candidate.authors.iter().any(|a| seed.authors.contains(a));
    CATEGORY_WEIGHT * jaccard(&seed.categories, &candidate.categories)
        + KEYWORD_WEIGHT * jaccard(&seed.keywords, &candidate.keywords)
        + if same_author { AUTHOR_WEIGHT } else { 0.0 }
}

pub fn freshness(age_days: f64) -> f64 {
    1.0 / (1.0 + age_days.max(0.0) / FRESHNESS_DAYS)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scored {
    pub novel_id: i64,
    pub score: f64,
    pub click_count: i64,
}

/// Order by score, then popularity, then id, and keep the first `limit`.
pub fn top(mut scored: Vec<Scored>, limit: usize) -> Vec<Scored> {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(b.click_count.cmp(&a.click_count))
            .then(a.novel_id.cmp(&b.novel_id))
    });
    scored.truncate(limit);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: i64 = 1;
    const B: i64 = 2;
    const C: i64 = 3;
    const X: i64 = 10;
    const Y: i64 = 11;
    const Z: i64 = 12;

    #[test]
    fn jaccard_of_empty_sets_is_zero() {
        let empty: HashSet<i64> = HashSet::new();
        assert_eq!(jaccard(&empty, &empty), 0.0);
        assert_eq!(jaccard(&HashSet::from([1]), &empty), 0.0);
        assert_eq!(jaccard(&HashSet::from([1, 2]), &HashSet::from([2, 3])), 1.0 / 3.0);
    }

    #[test]
    fn weighted_score_matches_hand_computation() {
        let seed = Features::new([A, B], [X, Y], "u");
        let p = Features::new([A, B, C], [X, Z], "u");
        let q = Features::new([A], [X], "v");

        let sp = similarity(&seed, &p);
        let sq = similarity(&seed, &q);
        assert!((sp - (0.5 * 2.0 / 3.0 + 0.3 / 3.0 + 0.2)).abs() < 1e-9);
        assert!((sp - 0.633_333_333).abs() < 1e-6);
        assert!((sq - 0.4).abs() < 1e-9);
        assert!(sp > sq);
    }

    #[test]
    fn empty_author_never_matches() {
        let seed = Features::new([A], [], "");
        let candidate = Features::new([A], [], "  ");
        assert!(seed.authors.is_empty());
        assert!((similarity(&seed, &candidate) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn freshness_decays_with_age() {
        assert_eq!(freshness(0.0), 1.0);
        assert!((freshness(30.0) - 0.5).abs() < 1e-9);
        assert_eq!(freshness(-5.0), 1.0);
    }

    #[test]
    fn ties_break_on_clicks_then_id() {
        let ranked = top(
            vec![
                Scored { novel_id: 3, score: 0.5, click_count: 10 },
                Scored { novel_id: 2, score: 0.5, click_count: 10 },
                Scored { novel_id: 1, score: 0.5, click_count: 1 },
                Scored { novel_id: 4, score: 0.9, click_count: 0 },
            ],
            3,
        );
        let ids: Vec<i64> = ranked.iter().map(|s| s.novel_id).collect();
        assert_eq!(ids, vec![4, 2, 3]);
    }
}
