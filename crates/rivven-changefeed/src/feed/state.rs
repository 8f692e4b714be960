//! Read cursor of a single partition.
//!
//! A [`ChangeFeedState`] is replaced wholesale at every page boundary. Its
//! serialized form is what a lease stores as its continuation: a versioned
//! JSON envelope, base64 wrapped.
//!
//! ```text
//! {"V":1,"Rid":"...","Mode":"Incremental","StartFrom":{"Type":"Beginning"},
//!  "FeedRange":{"PKRangeId":"0","Range":{...}},
//!  "Continuation":[{"token":"\"42\"","range":{"min":"","max":"FF"}}]}
//! ```

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::range::{FeedRange, Range};
use crate::error::{ChangeFeedError, Result};
use crate::store::{ChangeFeedRequest, RequestStart};

/// Envelope version written by this crate
pub const STATE_VERSION: u32 = 1;

/// Which changes the feed delivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeFeedMode {
    /// Latest version of each changed document
    Incremental,
    /// Every intermediate version plus deletes (not supported)
    FullFidelity,
}

/// Where a partition starts reading when it has no continuation of its own
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum ChangeFeedStartFrom {
    Beginning,
    Now,
    PointInTime {
        #[serde(rename = "PointInTime")]
        time: DateTime<Utc>,
    },
    /// Raw server continuation for the state's feed range
    Continuation {
        #[serde(rename = "Token")]
        token: String,
    },
    /// Legacy lease etag, scoped to the range it was recorded for
    LeaseEtagAndFeedRange {
        #[serde(rename = "Etag")]
        etag: String,
        #[serde(rename = "FeedRange")]
        feed_range: FeedRange,
    },
}

/// Server continuation for one sub-range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationEntry {
    pub token: String,
    pub range: Range,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "V")]
    version: u32,
    #[serde(rename = "Rid")]
    container_rid: String,
    #[serde(rename = "Mode")]
    mode: ChangeFeedMode,
    #[serde(rename = "StartFrom")]
    start_from: ChangeFeedStartFrom,
    #[serde(rename = "FeedRange")]
    feed_range: FeedRange,
    #[serde(rename = "Continuation", default, skip_serializing_if = "Vec::is_empty")]
    continuation: Vec<ContinuationEntry>,
}

/// Immutable read cursor of one partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFeedState {
    container_rid: String,
    feed_range: FeedRange,
    mode: ChangeFeedMode,
    start_from: ChangeFeedStartFrom,
    continuation: Vec<ContinuationEntry>,
}

impl ChangeFeedState {
    pub fn new(
        container_rid: impl Into<String>,
        feed_range: FeedRange,
        start_from: ChangeFeedStartFrom,
    ) -> Self {
        Self {
            container_rid: container_rid.into(),
            feed_range,
            mode: ChangeFeedMode::Incremental,
            start_from,
            continuation: Vec::new(),
        }
    }

    /// Build the starting state for a lease.
    ///
    /// A stored envelope is decoded and re-targeted to `feed_range`. Anything
    /// else stored in the lease is treated as a legacy server etag.
    pub fn for_lease(
        container_rid: &str,
        feed_range: &FeedRange,
        lease_continuation: Option<&str>,
        default_start: &ChangeFeedStartFrom,
    ) -> Result<Self> {
        match lease_continuation {
            None => Ok(Self::new(container_rid, feed_range.clone(), default_start.clone())),
            Some(raw) if Self::looks_like_envelope(raw) => {
                Ok(Self::from_envelope(raw)?.with_feed_range(feed_range.clone()))
            }
            Some(raw) => Ok(Self::new(
                container_rid,
                feed_range.clone(),
                ChangeFeedStartFrom::LeaseEtagAndFeedRange {
                    etag: raw.to_string(),
                    feed_range: feed_range.clone(),
                },
            )),
        }
    }

    pub fn container_rid(&self) -> &str {
        &self.container_rid
    }

    pub fn feed_range(&self) -> &FeedRange {
        &self.feed_range
    }

    pub fn mode(&self) -> ChangeFeedMode {
        self.mode
    }

    pub fn start_from(&self) -> &ChangeFeedStartFrom {
        &self.start_from
    }

    pub fn continuation(&self) -> &[ContinuationEntry] {
        &self.continuation
    }

    pub fn has_continuation(&self) -> bool {
        !self.continuation.is_empty()
    }

    /// Server token the next request resumes from
    pub fn continuation_token(&self) -> Option<&str> {
        self.continuation.first().map(|c| c.token.as_str())
    }

    /// New state resuming after `token`
    pub fn with_continuation(&self, token: impl Into<String>) -> Self {
        Self {
            continuation: vec![ContinuationEntry {
                token: token.into(),
                range: self.feed_range.range().clone(),
            }],
            ..self.clone()
        }
    }

    /// New state scoped to `feed_range`, continuation clipped to it.
    pub fn with_feed_range(&self, feed_range: FeedRange) -> Self {
        let target = feed_range.range().clone();
        let continuation = self
            .continuation
            .iter()
            .filter_map(|entry| {
                entry.range.intersect(&target).map(|range| ContinuationEntry {
                    token: entry.token.clone(),
                    range,
                })
            })
            .collect();
        let start_from = match &self.start_from {
            ChangeFeedStartFrom::LeaseEtagAndFeedRange { etag, .. } => {
                ChangeFeedStartFrom::LeaseEtagAndFeedRange {
                    etag: etag.clone(),
                    feed_range: feed_range.clone(),
                }
            }
            other => other.clone(),
        };
        Self {
            container_rid: self.container_rid.clone(),
            feed_range,
            mode: self.mode,
            start_from,
            continuation,
        }
    }

    /// Request for the next page
    pub fn to_request(&self, max_item_count: u32) -> ChangeFeedRequest {
        let start = match self.continuation_token() {
            Some(token) => RequestStart::IfNoneMatch(token.to_string()),
            None => match &self.start_from {
                ChangeFeedStartFrom::Beginning => RequestStart::Beginning,
                ChangeFeedStartFrom::Now => RequestStart::Now,
                ChangeFeedStartFrom::PointInTime { time } => RequestStart::PointInTime(*time),
                ChangeFeedStartFrom::Continuation { token } => {
                    RequestStart::IfNoneMatch(token.clone())
                }
                ChangeFeedStartFrom::LeaseEtagAndFeedRange { etag, .. } => {
                    RequestStart::IfNoneMatch(etag.clone())
                }
            },
        };
        ChangeFeedRequest {
            feed_range: self.feed_range.clone(),
            start,
            max_item_count,
        }
    }

    /// Serialize to the base64 envelope stored in leases
    pub fn to_envelope(&self) -> Result<String> {
        let envelope = Envelope {
            version: STATE_VERSION,
            container_rid: self.container_rid.clone(),
            mode: self.mode,
            start_from: self.start_from.clone(),
            feed_range: self.feed_range.clone(),
            continuation: self.continuation.clone(),
        };
        let json = serde_json::to_vec(&envelope)?;
        Ok(STANDARD.encode(json))
    }

    /// Decode a base64 envelope
    pub fn from_envelope(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| ChangeFeedError::Serialization(format!("invalid state encoding: {e}")))?;
        let envelope: Envelope = serde_json::from_slice(&bytes)?;
        if envelope.version != STATE_VERSION {
            return Err(ChangeFeedError::Serialization(format!(
                "unsupported state version {}",
                envelope.version
            )));
        }
        if envelope.mode != ChangeFeedMode::Incremental {
            return Err(ChangeFeedError::invalid_operation(format!(
                "change feed mode {:?} is not supported",
                envelope.mode
            )));
        }
        Ok(Self {
            container_rid: envelope.container_rid,
            feed_range: envelope.feed_range,
            mode: envelope.mode,
            start_from: envelope.start_from,
            continuation: envelope.continuation,
        })
    }

    fn looks_like_envelope(raw: &str) -> bool {
        STANDARD
            .decode(raw.trim())
            .ok()
            .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
            .map(|v| v.get("V").is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy(id: &str, min: &str, max: &str) -> FeedRange {
        FeedRange::PartitionKeyRange {
            id: id.into(),
            range: Range::new(min, max),
        }
    }

    #[test]
    fn test_envelope_preserves_state() {
        let state =
            ChangeFeedState::new("rid1", legacy("0", "", "FF"), ChangeFeedStartFrom::Beginning)
                .with_continuation("\"17\"");
        let encoded = state.to_envelope().unwrap();
        let decoded = ChangeFeedState::from_envelope(&encoded).unwrap();
        assert_eq!(decoded, state);
        assert_eq!(decoded.continuation_token(), Some("\"17\""));
    }

    #[test]
    fn test_rejects_unknown_version_and_full_fidelity() {
        let json = r#"{"V":9,"Rid":"r","Mode":"Incremental","StartFrom":{"Type":"Now"},"FeedRange":{"Range":{"min":"","max":"FF"}}}"#;
        let err = ChangeFeedState::from_envelope(&STANDARD.encode(json)).unwrap_err();
        assert!(matches!(err, ChangeFeedError::Serialization(_)));

        let json = r#"{"V":1,"Rid":"r","Mode":"FullFidelity","StartFrom":{"Type":"Now"},"FeedRange":{"Range":{"min":"","max":"FF"}}}"#;
        let err = ChangeFeedState::from_envelope(&STANDARD.encode(json)).unwrap_err();
        assert!(matches!(err, ChangeFeedError::InvalidOperation(_)));
    }

    #[test]
    fn test_for_lease_without_continuation_uses_default_start() {
        let range = legacy("1", "", "80");
        let state = ChangeFeedState::for_lease("rid", &range, None, &ChangeFeedStartFrom::Beginning)
            .unwrap();
        assert_eq!(state.to_request(10).start, RequestStart::Beginning);
        assert_eq!(state.to_request(10).max_item_count, 10);
    }

    #[test]
    fn test_for_lease_with_legacy_etag() {
        let range = legacy("1", "", "80");
        let state =
            ChangeFeedState::for_lease("rid", &range, Some("\"99\""), &ChangeFeedStartFrom::Now)
                .unwrap();
        assert!(matches!(
            state.start_from(),
            ChangeFeedStartFrom::LeaseEtagAndFeedRange { etag, .. } if etag == "\"99\""
        ));
        assert_eq!(
            state.to_request(5).start,
            RequestStart::IfNoneMatch("\"99\"".into())
        );
    }

    #[test]
    fn test_child_inherits_parent_continuation_clipped() {
        let parent = ChangeFeedState::new("rid", legacy("0", "", "FF"), ChangeFeedStartFrom::Now)
            .with_continuation("\"40\"");
        let envelope = parent.to_envelope().unwrap();

        let child_range = legacy("1", "", "80");
        let child = ChangeFeedState::for_lease(
            "rid",
            &child_range,
            Some(&envelope),
            &ChangeFeedStartFrom::Now,
        )
        .unwrap();
        assert_eq!(child.feed_range(), &child_range);
        assert_eq!(child.continuation().len(), 1);
        assert_eq!(child.continuation()[0].range, Range::new("", "80"));
        assert_eq!(
            child.to_request(1).start,
            RequestStart::IfNoneMatch("\"40\"".into())
        );
    }

    #[test]
    fn test_point_in_time_start() {
        let t = Utc::now();
        let state = ChangeFeedState::new(
            "rid",
            FeedRange::epk(Range::full()),
            ChangeFeedStartFrom::PointInTime { time: t },
        );
        assert_eq!(state.to_request(1).start, RequestStart::PointInTime(t));
        let decoded = ChangeFeedState::from_envelope(&state.to_envelope().unwrap()).unwrap();
        assert_eq!(decoded.start_from(), &ChangeFeedStartFrom::PointInTime { time: t });
    }
}
