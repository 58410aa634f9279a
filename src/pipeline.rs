//! The single ingest task: source → aggregator → publisher.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use futures_util::Stream;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::aggregator::SharedAggregator;
use crate::error::SourceError;
use crate::publisher::Publisher;
use crate::source::EventSource;
use crate::types::IngestOutcome;

/// Flush tick used when publishing is not rate limited.
const IDLE_FLUSH: Duration = Duration::from_secs(1);

/// Why [`Pipeline::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineExit {
    Shutdown,
    EndOfStream,
    ConnectionLost(String),
}

/// Publishes at most once per interval while there is unpublished state.
struct Throttle {
    min_interval: Duration,
    dirty: bool,
    last_publish: Option<Instant>,
}

impl Throttle {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            dirty: false,
            last_publish: None,
        }
    }

    fn due(&self, now: Instant) -> bool {
        self.dirty
            && self
                .last_publish
                .is_none_or(|last| now.duration_since(last) >= self.min_interval)
    }

    fn published(&mut self, now: Instant) {
        self.dirty = false;
        self.last_publish = Some(now);
    }
}

/// Wires an [`EventSource`] to the aggregator and publisher.
#[derive(Clone)]
pub struct Pipeline {
    stats: SharedAggregator,
    publisher: Publisher,
    min_interval: Duration,
}

impl Pipeline {
    pub fn new(stats: SharedAggregator, publisher: Publisher, min_interval: Duration) -> Self {
        Self {
            stats,
            publisher,
            min_interval,
        }
    }

    pub fn stats(&self) -> &SharedAggregator {
        &self.stats
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Drain `source` until it ends, fails, or shutdown is signalled.
    ///
    /// Every accepted event is folded into the aggregator right away; updates
    /// are published at most once per `min_interval`. Unpublished state is
    /// flushed before returning.
    pub async fn run<S, E>(
        &self,
        source: &mut EventSource<S>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> PipelineExit
    where
        S: Stream<Item = Result<Vec<u8>, E>> + Unpin,
        E: Display,
    {
        let mut throttle = Throttle::new(self.min_interval);
        let tick_every = if self.min_interval.is_zero() {
            IDLE_FLUSH
        } else {
            self.min_interval
        };
        let mut flush = tokio::time::interval(tick_every);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                biased;

                _ = wait_for_shutdown(shutdown) => break PipelineExit::Shutdown,

                _ = flush.tick() => {
                    let now = Instant::now();
                    if throttle.due(now) {
                        self.publisher.publish_latest();
                        throttle.published(now);
                    }
                }

                next = source.next_event() => match next {
                    Ok(Some(event)) => {
                        if let IngestOutcome::Accepted(_) = self.stats.ingest(event) {
                            throttle.dirty = true;
                            let now = Instant::now();
                            if throttle.due(now) {
                                self.publisher.publish_latest();
                                throttle.published(now);
                            }
                        }
                    }
                    Ok(None) => break PipelineExit::EndOfStream,
                    Err(SourceError::ConnectionLost(reason)) => {
                        break PipelineExit::ConnectionLost(reason);
                    }
                },
            }
        };

        if throttle.dirty {
            let sequence = self.publisher.publish_latest();
            debug!(sequence, "final flush");
        }
        exit
    }
}

/// Resolves once shutdown is requested or the sender is gone.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Run the pipeline over fresh sources until shutdown.
///
/// `connect` is called for every (re)connection attempt. Aggregate state
/// persists across reconnects.
pub async fn supervise<S, E, F, Fut>(
    pipeline: &Pipeline,
    mut connect: F,
    reconnect_delay: Duration,
    shutdown: &mut watch::Receiver<bool>,
) where
    S: Stream<Item = Result<Vec<u8>, E>> + Unpin,
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<EventSource<S>>>,
{
    loop {
        if *shutdown.borrow() {
            break;
        }

        let connected = tokio::select! {
            biased;
            _ = wait_for_shutdown(shutdown) => break,
            connected = connect() => connected,
        };

        match connected {
            Ok(mut source) => {
                let exit = pipeline.run(&mut source, shutdown).await;
                let s = source.stats();
                info!(
                    "Source closed: {} payloads, {} events, {} decode errors, {} skipped, {} invalid",
                    s.payloads, s.events, s.decode_errors, s.skipped_fills, s.invalid_fills
                );
                match exit {
                    PipelineExit::Shutdown => break,
                    PipelineExit::EndOfStream => info!("Upstream stream ended"),
                    PipelineExit::ConnectionLost(reason) => warn!("Connection lost: {reason}"),
                }
            }
            Err(e) => warn!("Connect failed: {e:#}"),
        }

        info!("Reconnecting in {}s...", reconnect_delay.as_secs_f64());
        tokio::select! {
            biased;
            _ = wait_for_shutdown(shutdown) => break,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
    }
    info!("Pipeline stopped");
}
