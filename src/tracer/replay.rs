use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::event::{EventRecord, Provider};
use super::parse::{parse_line, ReplayLine};
use super::stats::LostEventCounters;
use super::{EventSource, SessionError, SessionSummary};

/// ReplaySource replays newline-delimited JSON event records captured
/// from a live session.
pub struct ReplaySource {
    reader: Box<dyn BufRead + Send>,
    frequency: u64,
    enabled: HashSet<Provider>,
    lost: Arc<LostEventCounters>,
    started: bool,
}

impl ReplaySource {
    /// Open a replay file.
    pub fn open(path: &Path, frequency: u64) -> Result<Self, SessionError> {
        let file = File::open(path).map_err(|source| SessionError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self::from_reader(file, frequency))
    }

    /// Replay from any reader, e.g. an in-memory buffer.
    pub fn from_reader<R: Read + Send + 'static>(reader: R, frequency: u64) -> Self {
        Self {
            reader: Box::new(BufReader::new(reader)),
            frequency,
            enabled: HashSet::new(),
            lost: Arc::new(LostEventCounters::default()),
            started: false,
        }
    }
}

impl EventSource for ReplaySource {
    fn enable_provider(&mut self, provider: Provider) -> Result<(), SessionError> {
        if self.started {
            return Err(SessionError::EnableAfterStart { provider });
        }

        self.enabled.insert(provider);

        Ok(())
    }

    fn frequency(&self) -> u64 {
        self.frequency
    }

    fn lost_counters(&self) -> Arc<LostEventCounters> {
        Arc::clone(&self.lost)
    }

    fn run(
        &mut self,
        cancel: &CancellationToken,
        handler: &mut dyn FnMut(&EventRecord),
    ) -> Result<SessionSummary, SessionError> {
        self.started = true;

        let mut summary = SessionSummary::default();
        let mut buf = Vec::new();
        let mut line_no = 0u64;

        loop {
            if cancel.is_cancelled() {
                info!("Replay cancelled");
                break;
            }

            buf.clear();
            if self.reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            line_no += 1;

            let Ok(line) = std::str::from_utf8(&buf) else {
                debug!(line = line_no, "Skipping replay line that is not UTF-8");
                summary.malformed += 1;
                continue;
            };

            match parse_line(line) {
                Ok(ReplayLine::Event(ev)) => {
                    if self.enabled.contains(&ev.provider) {
                        handler(&ev);
                        summary.delivered += 1;
                    } else {
                        summary.filtered += 1;
                    }
                }
                Ok(ReplayLine::Lost { events, buffers }) => {
                    self.lost.record(events, buffers);
                }
                Ok(ReplayLine::Skip) => {}
                Err(e) => {
                    debug!(line = line_no, error = %e, "Skipping malformed replay line");
                    summary.malformed += 1;
                }
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACE: &str = r#"# two presents
{"provider":"dxgi","id":42,"opcode":1,"pid":1,"tid":2,"ts":10,"fields":{"pIDXGISwapChain":100,"Flags":0,"SyncInterval":1}}
{"provider":"dxgkrnl","id":178,"pid":1,"tid":2,"ts":11,"fields":{"SubmitSequence":5}}
{"lost":{"events":4,"buffers":1}}
not json at all
{"provider":"win32k","id":301,"pid":1,"tid":2,"ts":12}
"#;

    fn collect(source: &mut ReplaySource) -> (Vec<EventRecord>, SessionSummary) {
        let mut seen = Vec::new();
        let summary = source
            .run(&CancellationToken::new(), &mut |ev| seen.push(ev.clone()))
            .unwrap();
        (seen, summary)
    }

    #[test]
    fn test_replay_filters_by_enabled_provider() {
        let mut source = ReplaySource::from_reader(TRACE.as_bytes(), 1000);
        source.enable_provider(Provider::Dxgi).unwrap();
        source.enable_provider(Provider::DxgKrnl).unwrap();

        let (seen, summary) = collect(&mut source);

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].provider, Provider::Dxgi);
        assert_eq!(seen[1].provider, Provider::DxgKrnl);
        assert_eq!(
            summary,
            SessionSummary {
                delivered: 2,
                filtered: 1,
                malformed: 1,
            }
        );
        assert_eq!(source.lost_counters().totals(), (4, 1));
    }

    #[test]
    fn test_invalid_utf8_line_is_malformed() {
        let mut trace = Vec::new();
        trace.extend_from_slice(TRACE.lines().nth(1).unwrap_or_default().as_bytes());
        trace.extend_from_slice(b"\n\xff\xfe garbage\n");
        trace.extend_from_slice(TRACE.lines().nth(2).unwrap_or_default().as_bytes());
        trace.push(b'\n');

        let mut source = ReplaySource::from_reader(std::io::Cursor::new(trace), 1000);
        source.enable_provider(Provider::Dxgi).unwrap();
        source.enable_provider(Provider::DxgKrnl).unwrap();

        let (seen, summary) = collect(&mut source);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].provider, Provider::DxgKrnl);
        assert_eq!(summary.delivered, 2);
        assert_eq!(summary.malformed, 1);
    }

    #[test]
    fn test_enable_after_start_fails() {
        let mut source = ReplaySource::from_reader("".as_bytes(), 1000);
        collect(&mut source);

        assert!(matches!(
            source.enable_provider(Provider::Dwm),
            Err(SessionError::EnableAfterStart { .. })
        ));
    }

    #[test]
    fn test_cancelled_session_delivers_nothing() {
        let mut source = ReplaySource::from_reader(TRACE.as_bytes(), 1000);
        source.enable_provider(Provider::Dxgi).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut count = 0;
        let summary = source.run(&cancel, &mut |_| count += 1).unwrap();

        assert_eq!(count, 0);
        assert_eq!(summary.delivered, 0);
    }

    #[test]
    fn test_open_missing_file() {
        let err = ReplaySource::open(Path::new("/nonexistent/trace.jsonl"), 1000);
        assert!(matches!(err, Err(SessionError::Open { .. })));
    }
}
