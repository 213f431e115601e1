//! src/services/chunk_store.rs
//!
//! GridFS-style chunk store: per-upload metadata in the `files` table, the
//! payload split into fixed-size blocks in the `chunks` table, joined by
//! `files_id`. Uniform block size is what makes concatenation a metadata
//! update and range seeking an integer division.

use std::collections::BTreeMap;
use std::io;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::debug;

use crate::models::file_record::{ChunkRecord, FileRecord};
use crate::models::upload_info::UploadInfo;

/// Request body as the storage layer sees it.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// A lazy download: total byte count plus the buffer stream covering it.
pub struct FileDownload {
    pub length: u64,
    pub stream: BoxStream<'static, Result<Bytes, StorageError>>,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("upload `{0}` not found")]
    NotFound(String),
    #[error("upload `{0}` already exists")]
    AlreadyExists(String),
    #[error("{got}-byte block breaks the {expected}-byte chunk alignment")]
    UnevenChunks { expected: u64, got: u64 },
    #[error("size ceiling exceeded after reading {read} bytes")]
    MaxSizeExceeded { read: u64 },
    #[error("corrupt info record: {0}")]
    BadInfo(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Storage capability contract for resumable uploads.
///
/// Backends are interchangeable behind this trait; the SQLite two-table
/// implementation below is the reference. All implementations must keep the
/// uniform-chunk-size invariant: every chunk of an upload except the last
/// has exactly `chunk_size` bytes, and `files.length` equals their sum.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Insert an empty upload. Fails with `AlreadyExists` on a uid collision.
    async fn create_file(&self, uid: &str, info: &UploadInfo) -> StorageResult<()>;

    /// Append the body to the upload, block by block. The first persisted
    /// block fixes the upload's chunk size permanently; a trailing short
    /// block is accepted only when it completes the declared length.
    /// Returns the bytes appended by this call.
    async fn patch_file(
        &self,
        uid: &str,
        body: ByteStream,
        info: &UploadInfo,
    ) -> StorageResult<u64>;

    /// Stream the byte range (inclusive bounds), whole file when `None`.
    async fn read_file(&self, uid: &str, range: Option<(u64, u64)>)
        -> StorageResult<FileDownload>;

    /// Remove the upload and all of its chunks. Idempotent.
    async fn delete_file(&self, uid: &str) -> StorageResult<()>;

    /// Load the opaque info map.
    async fn read_info(&self, uid: &str) -> StorageResult<UploadInfo>;

    /// Replace the opaque info map wholesale.
    async fn update_info(&self, uid: &str, info: &UploadInfo) -> StorageResult<()>;

    /// Build `final_uid` by re-parenting the chunks of the given parts, in
    /// order, then delete the parts. Returns the summed length.
    async fn concatenate(
        &self,
        final_uid: &str,
        part_uids: &[String],
        info: &UploadInfo,
    ) -> StorageResult<u64>;

    /// Delete every upload last written at or before `before`, cascading to
    /// its chunks. Returns the number of uploads evicted.
    async fn expire_files(&self, before: DateTime<Utc>) -> StorageResult<u64>;

    /// Invoked once when an upload reaches its declared length. The seam for
    /// promoting finished artifacts elsewhere; a no-op by default.
    async fn finalize_file(&self, _uid: &str, _info: &UploadInfo) -> StorageResult<()> {
        Ok(())
    }
}

const INIT_SQL: &str = include_str!("../../migrations/0001_init.sql");

/// Run the embedded schema migration statement by statement.
pub async fn run_migrations(db: &SqlitePool) -> Result<(), sqlx::Error> {
    for stmt in INIT_SQL.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(stmt).execute(db).await?;
    }
    Ok(())
}

/// SQLite-backed reference implementation.
#[derive(Clone)]
pub struct SqliteChunkStore {
    db: SqlitePool,
    /// Block size used for an upload's first write.
    chunk_size: usize,
    /// Optional global byte ceiling.
    max_size: Option<u64>,
}

impl SqliteChunkStore {
    pub fn new(db: SqlitePool, chunk_size: usize, max_size: Option<u64>) -> Self {
        Self {
            db,
            chunk_size,
            max_size,
        }
    }

    async fn fetch_file(&self, uid: &str) -> StorageResult<FileRecord> {
        sqlx::query_as::<_, FileRecord>(
            "SELECT uid, length, chunk_size, upload_date, content_type, metadata
             FROM files WHERE uid = ?",
        )
        .bind(uid)
        .fetch_one(&self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::NotFound(uid.to_string()),
            other => StorageError::Sqlx(other),
        })
    }

    /// Persist one block and bump the file's length in a single transaction,
    /// so an aborted request leaves whole-chunk progress only.
    async fn append_chunk(
        &self,
        uid: &str,
        n: i64,
        data: &[u8],
        chunk_size: usize,
    ) -> StorageResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("INSERT INTO chunks (files_id, n, data) VALUES (?, ?, ?)")
            .bind(uid)
            .bind(n)
            .bind(data.to_vec())
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE files SET length = length + ?, chunk_size = COALESCE(chunk_size, ?),
             upload_date = ? WHERE uid = ?",
        )
        .bind(data.len() as i64)
        .bind(chunk_size as i64)
        .bind(Utc::now())
        .bind(uid)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ChunkStore for SqliteChunkStore {
    async fn create_file(&self, uid: &str, info: &UploadInfo) -> StorageResult<()> {
        let metadata = serde_json::to_string(info.as_map())
            .map_err(|e| StorageError::BadInfo(e.to_string()))?;
        let result = sqlx::query(
            "INSERT INTO files (uid, length, chunk_size, upload_date, content_type, metadata)
             VALUES (?, 0, NULL, ?, ?, ?)",
        )
        .bind(uid)
        .bind(Utc::now())
        .bind(info.content_type())
        .bind(metadata)
        .execute(&self.db)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(StorageError::AlreadyExists(uid.to_string()))
            }
            Err(err) => Err(StorageError::Sqlx(err)),
        }
    }

    async fn patch_file(
        &self,
        uid: &str,
        mut body: ByteStream,
        info: &UploadInfo,
    ) -> StorageResult<u64> {
        let file = self.fetch_file(uid).await?;
        let declared = info.length();
        let mut block_size = file.chunk_size.map(|s| s as usize);
        let mut offset = file.length as u64;
        let mut next_n: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE files_id = ?")
                .bind(uid)
                .fetch_one(&self.db)
                .await?;

        let mut pending = BytesMut::new();
        let mut written: u64 = 0;

        loop {
            let target = block_size.unwrap_or(self.chunk_size);
            while pending.len() < target {
                match body.next().await {
                    Some(piece) => pending.extend_from_slice(&piece?),
                    None => break,
                }
            }
            if pending.is_empty() {
                break;
            }

            let take = pending.len().min(target);
            if take < target && block_size.is_some() {
                // A short block is only legal as the terminal block.
                let terminal = declared.is_some_and(|len| offset + take as u64 == len);
                if !terminal {
                    return Err(StorageError::UnevenChunks {
                        expected: target as u64,
                        got: take as u64,
                    });
                }
            }
            if let Some(len) = declared {
                if offset + take as u64 > len {
                    return Err(StorageError::MaxSizeExceeded {
                        read: written + pending.len() as u64,
                    });
                }
            }
            if let Some(max) = self.max_size {
                if offset + take as u64 > max {
                    return Err(StorageError::MaxSizeExceeded {
                        read: written + pending.len() as u64,
                    });
                }
            }

            let block = pending.split_to(take).freeze();
            // The first block fixes the upload's chunk size for good.
            let size = block_size.unwrap_or(take);
            self.append_chunk(uid, next_n, &block, size).await?;
            block_size = Some(size);
            next_n += 1;
            offset += take as u64;
            written += take as u64;
        }

        if written == 0 {
            sqlx::query("UPDATE files SET upload_date = ? WHERE uid = ?")
                .bind(Utc::now())
                .bind(uid)
                .execute(&self.db)
                .await?;
        }

        debug!(uid = %uid, written, offset, "appended to upload");
        Ok(written)
    }

    async fn read_file(
        &self,
        uid: &str,
        range: Option<(u64, u64)>,
    ) -> StorageResult<FileDownload> {
        let file = self.fetch_file(uid).await?;
        let total = file.length as u64;
        let (start, end) = match range {
            Some((s, e)) => (s, e.min(total.saturating_sub(1))),
            None => (0, total.saturating_sub(1)),
        };
        if total == 0 || start >= total || start > end {
            return Ok(FileDownload {
                length: 0,
                stream: stream::empty().boxed(),
            });
        }

        // total > 0 implies at least one chunk, hence a recorded chunk size.
        let chunk_size = file
            .chunk_size
            .ok_or_else(|| StorageError::BadInfo(format!("upload `{uid}` has no chunk size")))?
            as u64;
        let first = start / chunk_size;
        let last = end / chunk_size;

        let db = self.db.clone();
        let uid = uid.to_string();
        let stream = stream::try_unfold(first, move |n| {
            let db = db.clone();
            let uid = uid.clone();
            async move {
                if n > last {
                    return Ok(None);
                }
                let chunk: ChunkRecord = sqlx::query_as(
                    "SELECT files_id, n, data FROM chunks WHERE files_id = ? AND n = ?",
                )
                .bind(&uid)
                .bind(n as i64)
                .fetch_one(&db)
                .await?;
                let mut buf = Bytes::from(chunk.data);
                let chunk_start = n * chunk_size;
                if n == last {
                    buf.truncate((end - chunk_start + 1) as usize);
                }
                if n == first && start > chunk_start {
                    buf = buf.split_off((start - chunk_start) as usize);
                }
                Ok(Some((buf, n + 1)))
            }
        })
        .boxed();

        Ok(FileDownload {
            length: end - start + 1,
            stream,
        })
    }

    async fn delete_file(&self, uid: &str) -> StorageResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE files_id = ?")
            .bind(uid)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM files WHERE uid = ?")
            .bind(uid)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        if result.rows_affected() > 0 {
            debug!(uid = %uid, "deleted upload");
        }
        Ok(())
    }

    async fn read_info(&self, uid: &str) -> StorageResult<UploadInfo> {
        let file = self.fetch_file(uid).await?;
        let map: BTreeMap<String, String> = serde_json::from_str(&file.metadata)
            .map_err(|e| StorageError::BadInfo(e.to_string()))?;
        let mut info = UploadInfo::from_map(map);
        // files.length is the committed truth; the map entry is a cache that
        // can lag after an interrupted write.
        info.set_offset(file.length as u64);
        Ok(info)
    }

    async fn update_info(&self, uid: &str, info: &UploadInfo) -> StorageResult<()> {
        let metadata = serde_json::to_string(info.as_map())
            .map_err(|e| StorageError::BadInfo(e.to_string()))?;
        let result = sqlx::query("UPDATE files SET metadata = ?, content_type = ? WHERE uid = ?")
            .bind(metadata)
            .bind(info.content_type())
            .bind(uid)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(uid.to_string()));
        }
        Ok(())
    }

    async fn concatenate(
        &self,
        final_uid: &str,
        part_uids: &[String],
        info: &UploadInfo,
    ) -> StorageResult<u64> {
        let mut tx = self.db.begin().await?;

        let mut parts = Vec::with_capacity(part_uids.len());
        for uid in part_uids {
            let part: Option<FileRecord> = sqlx::query_as(
                "SELECT uid, length, chunk_size, upload_date, content_type, metadata
                 FROM files WHERE uid = ?",
            )
            .bind(uid)
            .fetch_optional(&mut *tx)
            .await?;
            parts.push(part.ok_or_else(|| StorageError::NotFound(uid.clone()))?);
        }

        // Uniform chunk size across the parts: interior parts must be exact
        // multiples of the common size; only the last part may end short,
        // either by a short tail chunk or as a single chunk smaller than the
        // common size.
        let common = parts.iter().find_map(|p| p.chunk_size).unwrap_or(0);
        for (i, part) in parts.iter().enumerate() {
            let Some(size) = part.chunk_size else {
                continue; // empty part, contributes no chunks
            };
            let is_last = i == parts.len() - 1;
            if size == common {
                if !is_last && part.length % common != 0 {
                    return Err(StorageError::UnevenChunks {
                        expected: common as u64,
                        got: (part.length % common) as u64,
                    });
                }
            } else if !is_last || size > common || part.length > size {
                return Err(StorageError::UnevenChunks {
                    expected: common as u64,
                    got: size as u64,
                });
            }
        }

        let total: i64 = parts.iter().map(|p| p.length).sum();
        let metadata = serde_json::to_string(info.as_map())
            .map_err(|e| StorageError::BadInfo(e.to_string()))?;
        let inserted = sqlx::query(
            "INSERT INTO files (uid, length, chunk_size, upload_date, content_type, metadata)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(final_uid)
        .bind(total)
        .bind((common != 0).then_some(common))
        .bind(Utc::now())
        .bind(info.content_type())
        .bind(metadata)
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(StorageError::AlreadyExists(final_uid.to_string()))
            }
            Err(err) => return Err(StorageError::Sqlx(err)),
        }

        // Re-parent every part's chunks under the final uid, renumbering
        // sequentially in part order. No data moves.
        let mut base: i64 = 0;
        for part in &parts {
            if let Some(size) = part.chunk_size {
                sqlx::query("UPDATE chunks SET files_id = ?, n = n + ? WHERE files_id = ?")
                    .bind(final_uid)
                    .bind(base)
                    .bind(&part.uid)
                    .execute(&mut *tx)
                    .await?;
                base += (part.length + size - 1) / size;
            }
            sqlx::query("DELETE FROM files WHERE uid = ?")
                .bind(&part.uid)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(uid = %final_uid, parts = parts.len(), total, "concatenated upload");
        Ok(total as u64)
    }

    async fn expire_files(&self, before: DateTime<Utc>) -> StorageResult<u64> {
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "DELETE FROM chunks WHERE files_id IN (SELECT uid FROM files WHERE upload_date <= ?)",
        )
        .bind(before)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query("DELETE FROM files WHERE upload_date <= ?")
            .bind(before)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
