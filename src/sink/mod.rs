pub mod jsonl;
pub mod summary;

use anyhow::Result;

use crate::aggregate::{Aggregator, Report};

/// Sink consumes each consumer tick's report and writes it out.
pub trait Sink: Send {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Write the records accepted in one batch.
    fn write(&mut self, report: &Report) -> Result<()>;

    /// Called once per consumer tick after the batch has been applied.
    fn tick(&mut self, _aggregator: &Aggregator) -> Result<()> {
        Ok(())
    }

    /// Flush and release resources. Called once after the final drain.
    fn close(&mut self) -> Result<()>;
}
