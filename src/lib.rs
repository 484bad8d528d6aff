//! Tiger Sync: realtime synchronization and caching layer for Tiger CRM.
//!
//! ARCHITECTURE
//! ============
//! Everything here is client-side glue between a hosted backend (row queries,
//! change streams, presence channels, serverless functions) and view state.
//! The backend is reached only through the [`backend::Backend`] trait so the
//! same stores run against the hosted service or the in-process
//! [`backend::memory::MemoryBackend`].
//!
//! Components, leaf first:
//! - [`translation`]: memoized detect + translate with in-flight dedup.
//! - [`presence`]: channel roster with visibility-gated heartbeats.
//! - [`telemetry`]: per-drone snapshot merge and connectivity inference.
//! - [`recovery`]: bounded retry around a caller-supplied recovery action.
//! - [`rate_limit`]: sliding-window limiter for admin auth attempts.
//! - [`resource`]: fetch + subscribe + reconcile stores for CRM tables.
//!
//! View state is published through `tokio::sync::watch` channels; consumers
//! await `changed()` and re-read instead of polling.

pub mod backend;
pub mod config;
pub mod error;
pub mod functions;
pub mod notice;
pub mod presence;
pub mod rate_limit;
pub mod recovery;
pub mod resource;
pub mod telemetry;
pub mod translation;

pub use config::SyncConfig;
pub use error::ErrorCode;
