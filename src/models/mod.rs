//! Core data models for the resumable upload store.
//!
//! `FileRecord` and `ChunkRecord` map to database tables via `sqlx::FromRow`;
//! `UploadInfo` is the typed, request-scoped view over the tus header map
//! persisted alongside each upload.

pub mod file_record;
pub mod upload_info;
