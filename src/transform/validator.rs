//! Schema validation of raw queue payloads.

use serde::Deserialize;
use serde::de::Error as _;
use snafu::prelude::*;

use crate::error::{NotUtf8Snafu, SchemaSnafu, ValidationError};
use crate::record::{ParsedRecord, RawRecord};

/// Checks raw payloads against the fixed six-field record schema.
///
/// All of `id`, `subreddit`, `selftext`, `title`, `created_utc` and `url`
/// must be present and of the right type. Extra fields are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator;

impl SchemaValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, raw: &RawRecord) -> Result<ParsedRecord, ValidationError> {
        let (partition, offset) = (raw.partition, raw.offset);

        let text = std::str::from_utf8(&raw.payload)
            .ok()
            .context(NotUtf8Snafu { partition, offset })?;

        let value: serde_json::Value =
            serde_json::from_str(text).context(SchemaSnafu { partition, offset })?;

        // A six-element array would otherwise deserialize positionally.
        if !value.is_object() {
            return Err(serde_json::Error::custom("expected a JSON object"))
                .context(SchemaSnafu { partition, offset });
        }

        ParsedRecord::deserialize(value).context(SchemaSnafu { partition, offset })
    }
}
