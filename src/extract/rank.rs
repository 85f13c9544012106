//! Candidate ranking and near-duplicate removal.

use std::cmp::Ordering;
use std::collections::HashSet;

/// Something the ranker can score and compare.
pub trait Candidate {
    /// Stable identity; exact repeats are never accepted twice.
    fn id(&self) -> String;
    /// Text used for scoring and similarity.
    fn text(&self) -> String;
    /// Natural presentation order (page number, position in transcript).
    fn order_key(&self) -> i64;
}

/// Weighted vocabulary scorer.
#[derive(Debug, Clone)]
pub struct QualityScorer {
    pub signal: Vec<(&'static str, f64)>,
    pub noise: Vec<(&'static str, f64)>,
    pub causal: Vec<&'static str>,
    pub causal_bonus: f64,
    pub min_words: usize,
    pub short_penalty: f64,
    pub max_words: usize,
    pub long_penalty: f64,
}

impl Default for QualityScorer {
    fn default() -> Self {
        Self {
            signal: vec![
                ("guidance", 3.0),
                ("outlook", 2.5),
                ("strategy", 2.0),
                ("strategic", 2.0),
                ("margin", 1.5),
                ("restructur", 2.5),
                ("acquisition", 2.0),
                ("divest", 2.0),
                ("pricing", 1.5),
                ("capital allocation", 2.0),
                ("buyback", 1.5),
                ("market share", 1.5),
                ("raised", 1.0),
                ("lowered", 1.0),
                ("headwind", 1.0),
                ("tailwind", 1.0),
            ],
            noise: vec![
                ("quarter-over-quarter", 1.5),
                ("quarter over quarter", 1.5),
                ("year-over-year", 1.0),
                ("as expected", 1.0),
                ("in line with", 1.0),
                ("thank you", 2.0),
                ("good morning", 2.0),
                ("forward-looking statements", 3.0),
                ("safe harbor", 3.0),
                ("agenda", 1.5),
            ],
            causal: vec![
                "because",
                "driven by",
                "due to",
                "as a result",
                "which means",
                "therefore",
                "led to",
                "resulting in",
            ],
            causal_bonus: 1.5,
            min_words: 6,
            short_penalty: 2.0,
            max_words: 80,
            long_penalty: 1.5,
        }
    }
}

impl QualityScorer {
    pub fn score(&self, text: &str) -> f64 {
        let lower = text.to_lowercase();
        let mut score = 0.0;
        for (term, weight) in &self.signal {
            if lower.contains(term) {
                score += weight;
            }
        }
        for (term, weight) in &self.noise {
            if lower.contains(term) {
                score -= weight;
            }
        }
        if self.causal.iter().any(|c| lower.contains(c)) {
            score += self.causal_bonus;
        }
        let words = lower.split_whitespace().count();
        if words < self.min_words {
            score -= self.short_penalty;
        }
        if words > self.max_words {
            score -= self.long_penalty;
        }
        score
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectOptions {
    pub max_count: usize,
    /// Jaccard similarity at or above which two candidates are duplicates.
    pub similarity_threshold: f64,
    /// Fill remaining slots from near-duplicates when the greedy pass runs short.
    pub backfill: bool,
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            max_count: 10,
            similarity_threshold: 0.6,
            backfill: false,
        }
    }
}

/// Lowercased alphanumeric tokens of two or more characters.
pub fn token_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1)
        .map(str::to_lowercase)
        .collect()
}

pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

struct Scored<C> {
    item: Option<C>,
    id: String,
    score: f64,
    order: i64,
    position: usize,
    tokens: HashSet<String>,
}

/// Pick up to `max_count` candidates, best first, skipping near-duplicates,
/// then return them in natural order.
pub fn select<C: Candidate>(
    candidates: Vec<C>,
    options: &SelectOptions,
    scorer: &QualityScorer,
) -> Vec<C> {
    let mut scored: Vec<Scored<C>> = candidates
        .into_iter()
        .enumerate()
        .map(|(position, item)| {
            let text = item.text();
            Scored {
                id: item.id(),
                score: scorer.score(&text),
                order: item.order_key(),
                position,
                tokens: token_set(&text),
                item: Some(item),
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.order.cmp(&b.order))
            .then(a.position.cmp(&b.position))
    });

    let mut accepted: Vec<usize> = Vec::new();
    let mut seen_ids: HashSet<String> = HashSet::new();

    for idx in 0..scored.len() {
        if accepted.len() >= options.max_count {
            break;
        }
        let candidate = &scored[idx];
        if seen_ids.contains(&candidate.id) {
            continue;
        }
        let duplicate = accepted.iter().any(|&a| {
            jaccard(&scored[a].tokens, &candidate.tokens) >= options.similarity_threshold
        });
        if !duplicate {
            seen_ids.insert(candidate.id.clone());
            accepted.push(idx);
        }
    }

    if options.backfill && accepted.len() < options.max_count {
        for idx in 0..scored.len() {
            if accepted.len() >= options.max_count {
                break;
            }
            if accepted.contains(&idx) || seen_ids.contains(&scored[idx].id) {
                continue;
            }
            seen_ids.insert(scored[idx].id.clone());
            accepted.push(idx);
        }
    }

    accepted.sort_by(|&a, &b| {
        scored[a]
            .order
            .cmp(&scored[b].order)
            .then(scored[a].position.cmp(&scored[b].position))
    });

    accepted
        .into_iter()
        .filter_map(|idx| scored[idx].item.take())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: &'static str,
        page: i64,
        text: &'static str,
    }

    impl Candidate for Item {
        fn id(&self) -> String {
            self.id.to_string()
        }
        fn text(&self) -> String {
            self.text.to_string()
        }
        fn order_key(&self) -> i64 {
            self.page
        }
    }

    fn item(id: &'static str, page: i64, text: &'static str) -> Item {
        Item { id, page, text }
    }

    #[test]
    fn signal_beats_noise() {
        let scorer = QualityScorer::default();
        let strong = scorer.score("We raised full-year guidance because pricing held up across every region");
        let weak = scorer.score("Revenue was up quarter-over-quarter as expected in line with plan");
        assert!(strong > weak);
        assert!(scorer.score("Thanks") < 0.0);
    }

    #[test]
    fn jaccard_edges() {
        let empty = HashSet::new();
        assert_eq!(jaccard(&empty, &empty), 1.0);
        let a = token_set("margin guidance raised");
        let b = token_set("Guidance raised, margin!");
        assert_eq!(jaccard(&a, &b), 1.0);
        assert_eq!(jaccard(&a, &token_set("totally unrelated words")), 0.0);
    }

    #[test]
    fn near_duplicates_are_dropped_and_order_restored() {
        let items = vec![
            item("a", 9, "We raised full-year guidance because pricing held up in every region"),
            item("b", 2, "We raised full-year guidance because pricing held up in every single region"),
            item("c", 5, "Restructuring of the European business is driven by a new capital allocation strategy"),
            item("d", 1, "Good morning and thank you for joining"),
        ];
        let picked = select(
            items,
            &SelectOptions {
                max_count: 3,
                ..SelectOptions::default()
            },
            &QualityScorer::default(),
        );
        let ids: Vec<_> = picked.iter().map(|i| i.id).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&"c"));
        assert!(!(ids.contains(&"a") && ids.contains(&"b")));
        let pages: Vec<_> = picked.iter().map(|i| i.page).collect();
        let mut sorted = pages.clone();
        sorted.sort();
        assert_eq!(pages, sorted);
    }

    #[test]
    fn accepted_pairs_stay_below_threshold() {
        let texts = [
            "guidance raised on strong pricing",
            "guidance raised on strong pricing power",
            "margin pressure from freight costs",
            "margin pressure from freight and labor costs",
            "buyback expanded after the acquisition closed",
            "new strategy for capital allocation",
            "strategy for capital allocation is new",
            "headwind from currency",
        ];
        let ids = ["0", "1", "2", "3", "4", "5", "6", "7"];
        let items: Vec<Item> = texts
            .iter()
            .zip(ids)
            .enumerate()
            .map(|(i, (t, id))| item(id, i as i64, *t))
            .collect();
        let options = SelectOptions {
            max_count: 8,
            similarity_threshold: 0.5,
            backfill: false,
        };
        let picked = select(items, &options, &QualityScorer::default());
        for (i, a) in picked.iter().enumerate() {
            for b in picked.iter().skip(i + 1) {
                assert!(jaccard(&token_set(a.text), &token_set(b.text)) < options.similarity_threshold);
            }
        }
        assert!(picked.len() < texts.len());
    }

    #[test]
    fn backfill_tops_up_but_skips_exact_id_repeats() {
        let items = vec![
            item("p1", 1, "guidance raised on strong pricing"),
            item("p2", 2, "guidance raised on strong pricing again"),
            item("p2", 2, "guidance raised on strong pricing again"),
        ];
        let options = SelectOptions {
            max_count: 3,
            similarity_threshold: 0.5,
            backfill: true,
        };
        let picked = select(items.clone(), &options, &QualityScorer::default());
        assert_eq!(picked.iter().map(|i| i.id).collect::<Vec<_>>(), vec!["p1", "p2"]);

        let strict = select(
            items,
            &SelectOptions {
                backfill: false,
                ..options
            },
            &QualityScorer::default(),
        );
        assert_eq!(strict.len(), 1);
    }

    #[test]
    fn ties_break_on_natural_key() {
        let items = vec![
            item("late", 8, "alpha beta gamma"),
            item("early", 3, "delta epsilon zeta"),
        ];
        let picked = select(
            items,
            &SelectOptions {
                max_count: 1,
                ..SelectOptions::default()
            },
            &QualityScorer::default(),
        );
        assert_eq!(picked[0].id, "early");
    }
}
