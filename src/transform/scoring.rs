//! Relevance scoring functions.

use std::collections::HashSet;

use crate::error::ScoreError;

/// A pure function from post text to a relevance score.
///
/// Plain closures `Fn(&str) -> i32` are scorers too:
///
/// ```
/// use flurry::transform::Scorer;
/// let by_length = |text: &str| text.len() as i32;
/// assert_eq!(by_length.score("hello").unwrap(), 5);
/// ```
pub trait Scorer: Send + Sync {
    fn score(&self, text: &str) -> Result<i32, ScoreError>;
}

impl<F> Scorer for F
where
    F: Fn(&str) -> i32 + Send + Sync,
{
    fn score(&self, text: &str) -> Result<i32, ScoreError> {
        Ok(self(text))
    }
}

/// Counts whole-word, case-insensitive occurrences of a keyword set.
#[derive(Debug, Clone, Default)]
pub struct KeywordScorer {
    keywords: HashSet<String>,
}

impl KeywordScorer {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }
}

impl Scorer for KeywordScorer {
    fn score(&self, text: &str) -> Result<i32, ScoreError> {
        let hits = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|word| !word.is_empty() && self.keywords.contains(&word.to_lowercase()))
            .count();
        Ok(i32::try_from(hits).unwrap_or(i32::MAX))
    }
}
