//! Lifecycle extension points around the upload state machine.
//!
//! Hooks run synchronously inside the request; a failure propagates to the
//! client as a 500. Authentication and post-processing belong here, not in
//! the protocol core.

use async_trait::async_trait;

use crate::models::upload_info::UploadInfo;

#[async_trait]
pub trait UploadHooks: Send + Sync {
    /// Runs before the upload is created; failing here aborts the POST.
    async fn before_create(&self, _uid: &str, _info: &UploadInfo) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs after the upload exists in storage.
    async fn after_create(&self, _uid: &str, _info: &UploadInfo) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs when a PATCH brings the upload to its declared length.
    async fn after_finish(&self, _uid: &str, _info: &UploadInfo) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs after a DELETE removed the upload.
    async fn after_terminate(&self, _uid: &str, _info: &UploadInfo) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Default hook set: every extension point is a no-op.
pub struct NoopHooks;

#[async_trait]
impl UploadHooks for NoopHooks {}
