// ABOUTME: Versioned, timestamped snapshot of application state and its textual codec.
// ABOUTME: Encodes as a single JSON object {version, payload, savedAt} and decodes without panicking.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors that can occur while encoding or decoding a snapshot.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed snapshot: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("snapshot version must be at least 1")]
    ZeroVersion,

    #[error("failed to encode snapshot: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Application state as it is persisted: an opaque payload tagged with the
/// schema version it was written under and the time it was saved.
///
/// Snapshots are values. Migrations and re-saves produce new snapshots
/// rather than editing an existing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: u32,
    pub payload: Value,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub saved_at: DateTime<Utc>,
}

impl Snapshot {
    /// Build a snapshot stamped with the current time, at the millisecond
    /// precision it is stored with.
    pub fn new(version: u32, payload: Value) -> Self {
        Self {
            version,
            payload,
            saved_at: Utc::now().trunc_subsecs(3),
        }
    }
}

/// Borrowing twin of `Snapshot` so encoding never clones the payload.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotRef<'a> {
    version: u32,
    payload: &'a Value,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    saved_at: DateTime<Utc>,
}

/// Encode a payload as a snapshot at `version`, stamped with `savedAt = now`.
pub fn encode(version: u32, payload: &Value) -> Result<String, CodecError> {
    write(version, payload, Utc::now())
}

/// Encode an existing snapshot, keeping its original `savedAt`.
pub fn encode_snapshot(snapshot: &Snapshot) -> Result<String, CodecError> {
    write(snapshot.version, &snapshot.payload, snapshot.saved_at)
}

fn write(version: u32, payload: &Value, saved_at: DateTime<Utc>) -> Result<String, CodecError> {
    if version == 0 {
        return Err(CodecError::ZeroVersion);
    }
    let blob = SnapshotRef {
        version,
        payload,
        saved_at,
    };
    serde_json::to_string(&blob).map_err(CodecError::Encode)
}

/// Decode a stored blob. Truncated or malformed input yields `CodecError`,
/// which callers treat the same as "nothing stored".
pub fn decode(text: &str) -> Result<Snapshot, CodecError> {
    let snapshot: Snapshot = serde_json::from_str(text).map_err(CodecError::Decode)?;
    if snapshot.version == 0 {
        return Err(CodecError::ZeroVersion);
    }
    Ok(snapshot)
}
