//! File-arrival events from the message bus.

use serde::{Deserialize, Serialize};

use perf_core::errors::{PerfError, Result};
use perf_core::tile::CommitNumber;

/// The payload of a file-arrival event. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    pub bucket: String,
    pub name: String,
}

impl FileEvent {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| PerfError::invalid_input(format!("malformed file event: {e}")))
    }

    /// The object's URI, used for prefix filtering and source interning.
    pub fn uri(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.name)
    }
}

/// Published on the secondary topic after a file lands in the trace
/// store; event-driven scanners consume the touched commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestedEvent {
    pub bucket: String,
    pub name: String,
    pub git_hash: String,
    pub commit_number: CommitNumber,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ignores_extra_fields() {
        let event =
            FileEvent::parse(br#"{"bucket": "b", "name": "n/f.json", "etag": "xyz"}"#).unwrap();
        assert_eq!(event.bucket, "b");
        assert_eq!(event.name, "n/f.json");
        assert_eq!(event.uri(), "gs://b/n/f.json");
    }

    #[test]
    fn parse_rejects_missing_fields() {
        assert!(FileEvent::parse(br#"{"bucket": "b"}"#).is_err());
        assert!(FileEvent::parse(b"garbage").is_err());
    }
}
