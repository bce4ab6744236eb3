//! Durable checkpoint document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::record::{Offset, PartitionId};

/// Current checkpoint document version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Last committed offset of every partition.
///
/// An entry `p -> o` means every record of `p` up to and including `o` is in
/// the destination table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub version: u32,
    pub offsets: BTreeMap<PartitionId, Offset>,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointState {
    pub fn new(offsets: BTreeMap<PartitionId, Offset>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            offsets,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_json_shape() {
        let state = CheckpointState::new(BTreeMap::from([(0, 99), (3, 7)]));
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["offsets"]["0"], 99);
        assert_eq!(json["offsets"]["3"], 7);

        let restored: CheckpointState = serde_json::from_value(json).unwrap();
        assert_eq!(restored, state);
    }
}
