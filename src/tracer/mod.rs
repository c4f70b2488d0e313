pub mod event;
pub mod parse;
pub mod replay;
pub mod stats;

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use self::event::{EventRecord, Provider};
use self::stats::LostEventCounters;

/// Session-level failures. These are fatal to the whole engine.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("opening trace source {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("enabling provider {provider}: session already running")]
    EnableAfterStart { provider: Provider },

    #[error("enabling provider {provider}: {reason}")]
    Enable { provider: Provider, reason: String },

    #[error("reading trace source: {0}")]
    Read(#[from] std::io::Error),
}

/// Totals reported when a session finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// Records delivered to the handler.
    pub delivered: u64,
    /// Records from providers that were never enabled.
    pub filtered: u64,
    /// Lines the source could not decode.
    pub malformed: u64,
}

/// EventSource decodes trace buffers into typed records and delivers them
/// on the calling (producer) thread.
///
/// Records are delivered in non-decreasing timestamp order per provider.
/// `run` returns when the source is exhausted or `cancel` fires.
pub trait EventSource: Send {
    /// Subscribe to a provider. Only valid before `run`.
    fn enable_provider(&mut self, provider: Provider) -> Result<(), SessionError>;

    /// Ticks per second of record timestamps.
    fn frequency(&self) -> u64;

    /// Counters the source bumps when the OS reports lost events or buffers.
    fn lost_counters(&self) -> Arc<LostEventCounters>;

    /// Deliver records to `handler` until exhausted or cancelled.
    fn run(
        &mut self,
        cancel: &CancellationToken,
        handler: &mut dyn FnMut(&EventRecord),
    ) -> Result<SessionSummary, SessionError>;
}
