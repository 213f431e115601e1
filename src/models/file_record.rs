//! Row types backing the chunked upload store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One resumable upload as persisted in the `files` table.
///
/// `length` counts the bytes durably written so far and always equals the
/// protocol offset; the actual payload lives in the `chunks` table.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FileRecord {
    /// Opaque upload identifier (32 lowercase hex chars).
    pub uid: String,

    /// Bytes persisted so far; equals the sum of all chunk sizes.
    pub length: i64,

    /// Fixed block size for this upload, set permanently by the first write.
    pub chunk_size: Option<i64>,

    /// Timestamp of the last successful write; the expiration clock.
    pub upload_date: DateTime<Utc>,

    /// MIME type extracted from the upload metadata, if declared.
    pub content_type: Option<String>,

    /// Opaque tus header map, JSON-encoded.
    pub metadata: String,
}

/// One block of an upload in the `chunks` table.
///
/// Every chunk of an upload except the last has exactly `chunk_size` bytes.
#[derive(Clone, FromRow, Debug)]
pub struct ChunkRecord {
    /// Owning upload uid.
    pub files_id: String,

    /// 0-based block index.
    pub n: i64,

    /// Raw block bytes.
    pub data: Vec<u8>,
}
