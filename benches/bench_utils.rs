//! Benchmark utilities for generating queue payloads.

use rand::Rng;
use rand::seq::IndexedRandom;

use flurry::RawRecord;

const WORDS: &[&str] = &[
    "rust", "tokio", "async", "borrow", "checker", "lifetime", "trait", "crate", "macro",
    "compile", "error", "performance", "memory", "safety", "the", "a", "with", "and",
];

/// Generate a post body of roughly `words` words.
pub fn generate_text(words: usize) -> String {
    let mut rng = rand::rng();
    (0..words)
        .filter_map(|_| WORDS.choose(&mut rng).copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Generate raw records for one partition, with `invalid_ratio` of them
/// malformed.
pub fn generate_records(count: usize, invalid_ratio: f64) -> Vec<RawRecord> {
    let mut rng = rand::rng();

    (0..count)
        .map(|i| {
            let payload = if rng.random_bool(invalid_ratio) {
                format!(r#"{{"id":"post_{i}","selftext":"#)
            } else {
                serde_json::json!({
                    "id": format!("post_{i}"),
                    "subreddit": "rust",
                    "selftext": generate_text(rng.random_range(20..200)),
                    "title": format!("title {i}"),
                    "created_utc": 1_700_000_000.0 + i as f64,
                    "url": format!("https://example.com/{i}"),
                })
                .to_string()
            };
            RawRecord::new(0, i as i64, payload)
        })
        .collect()
}
