//! Duplicate Checker: an advisory similarity ranking of existing tasks.
//!
//! Titles are reduced to canonical tokens (stop words dropped, synonyms
//! folded) before comparing, so "Add user login" and "Implement user
//! authentication" meet in the middle.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;

use crate::config::DuplicatesConfig;
use crate::labels::LabelScheme;
use crate::store::{Issue, IssueQuery, IssueState, IssueStore, StateFilter};

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "up", "about", "into", "through", "during", "before", "after", "above", "below",
    "between", "under", "again", "further", "then", "once", "is", "are", "was", "were", "be",
    "been", "being", "have", "has", "had", "do", "does", "did", "will", "would", "could",
    "should", "may", "might", "must", "shall", "can", "need", "new", "some",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Possible,
    Likely,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Similarity {
    pub score: f64,
    pub title: f64,
    pub keywords: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateMatch {
    pub number: u64,
    pub title: String,
    pub state: IssueState,
    pub similarity: Similarity,
    pub verdict: Verdict,
}

pub struct DuplicateChecker {
    synonyms: HashMap<String, String>,
    title_weight: f64,
    possible: f64,
    likely: f64,
}

impl DuplicateChecker {
    pub fn new(config: &DuplicatesConfig) -> Self {
        let mut synonyms = HashMap::new();
        for group in &config.synonyms {
            let Some(head) = group.first() else {
                continue;
            };
            let head = head.to_lowercase();
            for word in group {
                synonyms.entry(word.to_lowercase()).or_insert_with(|| head.clone());
            }
        }
        Self {
            synonyms,
            title_weight: config.title_weight,
            possible: config.possible_threshold,
            likely: config.likely_threshold,
        }
    }

    /// Lower-cased words, stop words dropped, synonyms folded to their group head.
    pub fn canonical_tokens(&self, title: &str) -> Vec<String> {
        title
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty() && !STOP_WORDS.contains(w))
            .map(|w| self.synonyms.get(w).cloned().unwrap_or_else(|| w.to_string()))
            .collect()
    }

    pub fn similarity(&self, a: &str, b: &str) -> Similarity {
        let ta = self.canonical_tokens(a);
        let tb = self.canonical_tokens(b);
        let title = normalized_levenshtein(&ta.join(" "), &tb.join(" "));
        let keywords = jaccard(&ta, &tb);
        Similarity {
            score: self.title_weight * title + (1.0 - self.title_weight) * keywords,
            title,
            keywords,
        }
    }

    pub fn verdict(&self, score: f64) -> Option<Verdict> {
        if score >= self.likely {
            Some(Verdict::Likely)
        } else if score >= self.possible {
            Some(Verdict::Possible)
        } else {
            None
        }
    }

    /// Rank `candidates` against `title`, best first, dropping anything
    /// below the possible threshold.
    pub fn check<'i>(&self, title: &str, candidates: impl IntoIterator<Item = &'i Issue>) -> Vec<DuplicateMatch> {
        let mut matches: Vec<DuplicateMatch> = candidates
            .into_iter()
            .filter_map(|issue| {
                let similarity = self.similarity(title, &issue.title);
                let verdict = self.verdict(similarity.score)?;
                Some(DuplicateMatch {
                    number: issue.number,
                    title: issue.title.clone(),
                    state: issue.state,
                    similarity,
                    verdict,
                })
            })
            .collect();
        matches.sort_by(|a, b| {
            b.similarity
                .score
                .total_cmp(&a.similarity.score)
                .then(a.number.cmp(&b.number))
        });
        matches
    }

    /// Compare against every task, open or closed, including archived ones.
    pub fn check_store<S: IssueStore + ?Sized>(
        &self,
        store: &S,
        scheme: &LabelScheme,
        title: &str,
    ) -> anyhow::Result<Vec<DuplicateMatch>> {
        let mut issues = BTreeMap::new();
        for label in [scheme.task(), scheme.archived()] {
            let found = store.list_issues(&IssueQuery::labelled(&label).state(StateFilter::All))?;
            issues.extend(found.into_iter().map(|i| (i.number, i)));
        }
        Ok(self.check(title, issues.values()))
    }
}

/// 1 - edit distance / longer length, over chars. Two empty strings share
/// nothing.
pub fn normalized_levenshtein(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 0.0;
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut row = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            row[j + 1] = substitution.min(prev[j + 1] + 1).min(row[j] + 1);
        }
        std::mem::swap(&mut prev, &mut row);
    }
    #[allow(clippy::cast_precision_loss)]
    let distance = prev[b.len()] as f64 / longest as f64;
    1.0 - distance
}

fn jaccard(a: &[String], b: &[String]) -> f64 {
    let a: BTreeSet<&String> = a.iter().collect();
    let b: BTreeSet<&String> = b.iter().collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let ratio = a.intersection(&b).count() as f64 / union as f64;
    ratio
}
