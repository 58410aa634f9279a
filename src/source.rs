use std::collections::VecDeque;
use std::fmt::Display;

use futures_util::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::decode::decode_payload;
use crate::error::SourceError;
use crate::types::{Event, GroupBy};

/// Maximum number of payload bytes included in a decode-failure log line.
const LOG_PREVIEW_BYTES: usize = 256;

/// Running counters for one source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub payloads: u64,
    pub decode_errors: u64,
    pub events: u64,
    /// Fills without a grouping value.
    pub skipped_fills: u64,
    /// Malformed entries or fills without an identifier.
    pub invalid_fills: u64,
}

/// Turns a stream of raw payloads into a lazy sequence of [`Event`]s.
///
/// The source is single-use: once the underlying stream ends or fails it
/// keeps returning `Ok(None)`; build a new source to re-subscribe.
pub struct EventSource<S> {
    stream: S,
    group_by: GroupBy,
    pending: VecDeque<Event>,
    stats: SourceStats,
    finished: bool,
}

impl<S, E> EventSource<S>
where
    S: Stream<Item = Result<Vec<u8>, E>> + Unpin,
    E: Display,
{
    pub fn new(stream: S, group_by: GroupBy) -> Self {
        Self {
            stream,
            group_by,
            pending: VecDeque::new(),
            stats: SourceStats::default(),
            finished: false,
        }
    }

    /// Wait for the next event.
    ///
    /// Returns `Ok(None)` at end of stream and `Err(ConnectionLost)` when the
    /// transport fails. Payloads that do not decode are logged and skipped.
    ///
    /// Cancel safe: dropping the future loses no event.
    pub async fn next_event(&mut self) -> Result<Option<Event>, SourceError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                self.stats.events += 1;
                return Ok(Some(event));
            }
            if self.finished {
                return Ok(None);
            }

            match self.stream.next().await {
                None => {
                    info!("Upstream stream ended after {} payloads", self.stats.payloads);
                    self.finished = true;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Err(SourceError::ConnectionLost(e.to_string()));
                }
                Some(Ok(payload)) => self.accept_payload(&payload),
            }
        }
    }

    pub fn stats(&self) -> SourceStats {
        self.stats
    }

    fn accept_payload(&mut self, payload: &[u8]) {
        self.stats.payloads += 1;
        match decode_payload(payload, self.group_by) {
            Ok(block) => {
                self.stats.skipped_fills += block.skipped as u64;
                self.stats.invalid_fills += block.invalid as u64;
                if !block.events.is_empty() {
                    debug!(
                        block = ?block.block_number,
                        events = block.events.len(),
                        "decoded payload"
                    );
                }
                self.pending.extend(block.events);
            }
            Err(e) => {
                self.stats.decode_errors += 1;
                warn!("Skipping undecodable payload ({e}): {}", preview(payload));
            }
        }
    }
}

fn preview(payload: &[u8]) -> String {
    if payload.len() > LOG_PREVIEW_BYTES {
        format!(
            "{}...",
            String::from_utf8_lossy(&payload[..LOG_PREVIEW_BYTES])
        )
    } else {
        String::from_utf8_lossy(payload).into_owned()
    }
}
