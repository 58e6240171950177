//! Okapi BM25 lexical scoring
//!
//! Built fresh per query over the catalog's search texts; catalogs are
//! small enough that index construction is cheaper than maintaining an
//! incremental one.

use std::collections::HashMap;

const K1: f64 = 1.2;
const B: f64 = 0.75;

/// Lowercase alphanumeric tokens
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

pub struct Bm25Index {
    docs: Vec<HashMap<String, usize>>,
    doc_lengths: Vec<usize>,
    doc_freq: HashMap<String, usize>,
    avg_length: f64,
}

impl Bm25Index {
    pub fn build(texts: &[String]) -> Self {
        let mut docs = Vec::with_capacity(texts.len());
        let mut doc_lengths = Vec::with_capacity(texts.len());
        let mut doc_freq: HashMap<String, usize> = HashMap::new();

        for text in texts {
            let tokens = tokenize(text);
            doc_lengths.push(tokens.len());
            let mut counts: HashMap<String, usize> = HashMap::new();
            for token in tokens {
                *counts.entry(token).or_insert(0) += 1;
            }
            for term in counts.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            docs.push(counts);
        }

        let avg_length = if doc_lengths.is_empty() {
            0.0
        } else {
            doc_lengths.iter().sum::<usize>() as f64 / doc_lengths.len() as f64
        };

        Self {
            docs,
            doc_lengths,
            doc_freq,
            avg_length,
        }
    }

    /// Raw BM25 score of every document against `query`
    pub fn scores(&self, query: &str) -> Vec<f64> {
        let terms = tokenize(query);
        let n = self.docs.len() as f64;
        let mut scores = vec![0.0; self.docs.len()];

        for term in &terms {
            let Some(&df) = self.doc_freq.get(term) else {
                continue;
            };
            let idf = (((n - df as f64 + 0.5) / (df as f64 + 0.5)) + 1.0).ln();
            for (i, doc) in self.docs.iter().enumerate() {
                let tf = *doc.get(term).unwrap_or(&0) as f64;
                if tf == 0.0 {
                    continue;
                }
                let length_norm = 1.0 - B + B * (self.doc_lengths[i] as f64 / self.avg_length);
                scores[i] += idf * (tf * (K1 + 1.0)) / (tf + K1 * length_norm);
            }
        }
        scores
    }

    /// BM25 scores max-normalized into [0, 1]
    pub fn normalized_scores(&self, query: &str) -> Vec<f64> {
        let scores = self.scores(query);
        let max = scores.iter().cloned().fold(0.0_f64, f64::max);
        if max <= 0.0 {
            return scores;
        }
        scores.into_iter().map(|s| s / max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("Read a file from disk (UTF-8)"),
            vec!["read", "a", "file", "from", "disk", "utf", "8"]
        );
        assert!(tokenize("--- ***").is_empty());
    }

    #[test]
    fn test_relevant_doc_ranks_first() {
        let index = Bm25Index::build(&[
            "send an email message to a recipient".to_string(),
            "resize an image to given dimensions".to_string(),
            "search the web for pages".to_string(),
        ]);
        let scores = index.normalized_scores("email a message");
        assert!(scores[0] > scores[1]);
        assert!(scores[0] > scores[2]);
        assert_eq!(scores[0], 1.0);
    }

    #[test]
    fn test_no_overlap_scores_zero() {
        let index = Bm25Index::build(&["alpha beta".to_string(), "gamma delta".to_string()]);
        let scores = index.normalized_scores("omega");
        assert!(scores.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_empty_index() {
        let index = Bm25Index::build(&[]);
        assert!(index.normalized_scores("anything").is_empty());
    }
}
