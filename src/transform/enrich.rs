//! Enrichment stage: attach a relevance score to each parsed record.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::warn;

use super::Scorer;
use crate::config::{EnrichmentConfig, ScoringFailurePolicy};
use crate::error::ScoreError;
use crate::record::{EnrichedRecord, ParsedRecord};

/// Result of enriching one record.
#[derive(Debug)]
pub enum Enrichment {
    /// Scored normally.
    Scored(EnrichedRecord),
    /// The scorer failed; the record carries the sentinel score.
    Sentinel(EnrichedRecord),
    /// The scorer failed and the record was dropped.
    Dropped,
}

impl Enrichment {
    /// The record to hand to the sink, if any.
    pub fn into_record(self) -> Option<EnrichedRecord> {
        match self {
            Enrichment::Scored(record) | Enrichment::Sentinel(record) => Some(record),
            Enrichment::Dropped => None,
        }
    }

    pub fn is_scoring_failure(&self) -> bool {
        !matches!(self, Enrichment::Scored(_))
    }
}

/// Applies a [`Scorer`] to the `selftext` of each record.
pub struct Enricher {
    scorer: Arc<dyn Scorer>,
    policy: ScoringFailurePolicy,
    sentinel_score: i32,
}

impl Enricher {
    pub fn new(scorer: Arc<dyn Scorer>, config: &EnrichmentConfig) -> Self {
        Self {
            scorer,
            policy: config.on_failure,
            sentinel_score: config.sentinel_score,
        }
    }

    /// Score a record. Empty text is scored like any other.
    ///
    /// A failing or panicking scorer is handled by the configured policy;
    /// only [`ScoringFailurePolicy::Fail`] surfaces the error.
    pub fn enrich(&self, record: ParsedRecord) -> Result<Enrichment, ScoreError> {
        let scored = catch_unwind(AssertUnwindSafe(|| self.scorer.score(&record.selftext)))
            .unwrap_or_else(|payload| {
                Err(ScoreError::Panicked {
                    message: panic_message(payload.as_ref()),
                })
            });

        let error = match scored {
            Ok(relevance_score) => {
                return Ok(Enrichment::Scored(EnrichedRecord {
                    record,
                    relevance_score,
                    scoring_failed: false,
                }));
            }
            Err(error) => error,
        };

        match self.policy {
            ScoringFailurePolicy::Sentinel => {
                warn!(id = %record.id, error = %error, "Scoring failed, using sentinel score");
                Ok(Enrichment::Sentinel(EnrichedRecord {
                    record,
                    relevance_score: self.sentinel_score,
                    scoring_failed: true,
                }))
            }
            ScoringFailurePolicy::Drop => {
                warn!(id = %record.id, error = %error, "Scoring failed, dropping record");
                Ok(Enrichment::Dropped)
            }
            ScoringFailurePolicy::Fail => Err(error),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(selftext: &str) -> ParsedRecord {
        ParsedRecord {
            id: "p1".to_string(),
            subreddit: "rust".to_string(),
            selftext: selftext.to_string(),
            title: "t".to_string(),
            created_utc: 1.0,
            url: "u".to_string(),
        }
    }

    fn enricher(scorer: impl Scorer + 'static, on_failure: ScoringFailurePolicy) -> Enricher {
        let config = EnrichmentConfig {
            on_failure,
            ..Default::default()
        };
        Enricher::new(Arc::new(scorer), &config)
    }

    struct Rejecting;

    impl Scorer for Rejecting {
        fn score(&self, _text: &str) -> Result<i32, ScoreError> {
            Err(ScoreError::Rejected {
                message: "model offline".to_string(),
            })
        }
    }

    #[test]
    fn test_scores_selftext() {
        let enricher = enricher(|t: &str| t.len() as i32, ScoringFailurePolicy::Sentinel);
        let Enrichment::Scored(record) = enricher.enrich(parsed("hello")).unwrap() else {
            panic!("expected scored record");
        };
        assert_eq!(record.relevance_score, 5);
        assert!(!record.scoring_failed);
        assert_eq!(record.record, parsed("hello"));
    }

    #[test]
    fn test_empty_text_still_scored() {
        let enricher = enricher(|_: &str| 3, ScoringFailurePolicy::Sentinel);
        let record = enricher.enrich(parsed("")).unwrap().into_record().unwrap();
        assert_eq!(record.relevance_score, 3);
    }

    #[test]
    fn test_sentinel_policy() {
        let enricher = enricher(Rejecting, ScoringFailurePolicy::Sentinel);
        let outcome = enricher.enrich(parsed("x")).unwrap();
        assert!(outcome.is_scoring_failure());
        let record = outcome.into_record().unwrap();
        assert_eq!(record.relevance_score, -1);
        assert!(record.scoring_failed);
    }

    #[test]
    fn test_drop_policy() {
        let enricher = enricher(Rejecting, ScoringFailurePolicy::Drop);
        assert!(matches!(
            enricher.enrich(parsed("x")).unwrap(),
            Enrichment::Dropped
        ));
    }

    #[test]
    fn test_fail_policy() {
        let enricher = enricher(Rejecting, ScoringFailurePolicy::Fail);
        let err = enricher.enrich(parsed("x")).unwrap_err();
        assert!(matches!(err, ScoreError::Rejected { .. }));
    }

    #[test]
    fn test_panicking_scorer_is_contained() {
        let enricher = enricher(
            |_: &str| -> i32 { panic!("scorer exploded") },
            ScoringFailurePolicy::Fail,
        );
        let err = enricher.enrich(parsed("x")).unwrap_err();
        match err {
            ScoreError::Panicked { message } => assert_eq!(message, "scorer exploded"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
