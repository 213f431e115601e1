//! HTTP handlers: the tus upload controller plus health probes.

pub mod health_handlers;
pub mod upload_handlers;
