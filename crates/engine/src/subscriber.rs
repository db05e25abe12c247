//! Per-connection streaming of tile changes to a passive viewer.
//!
//! ```text
//! Attaching --(catch-up queued)--> Streaming --(push failed / probe failed / feed closed)--> Closing
//!                                    ^    |
//!                                    +----+ event pushed, or quiet period with a live probe
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::grid::Coord;
use crate::{Engine, RenderedTile};

/// The viewer went away mid-push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("subscriber disconnected")]
pub struct SubscriberDisconnected;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Gone,
}

/// Where rendered tiles go. Implemented by each transport.
pub trait TileSink: Send {
    fn push(
        &mut self,
        tile: &RenderedTile,
    ) -> impl Future<Output = Result<(), SubscriberDisconnected>> + Send;

    /// Cheap connection check used when no change arrived for a while.
    fn probe(&mut self, wait: Duration) -> impl Future<Output = Liveness> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Attaching,
    Streaming,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PushFailed,
    ProbeFailed,
    FeedClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReport {
    pub delivered: u64,
    pub reason: CloseReason,
    /// The change that could not be pushed, and how many other subscribers
    /// it was handed to.
    pub requeued: Option<(Coord, usize)>,
}

/// Runs one subscriber connection until it closes.
///
/// Dropping the returned future at any await point is safe: a change taken
/// off the queue but not yet pushed is requeued.
pub async fn stream_changes<S: TileSink>(engine: &Engine, sink: &mut S) -> StreamReport {
    let timing = &engine.config().subscriber;
    let (event_timeout, probe_timeout) = (timing.event_timeout(), timing.probe_timeout());

    let mut sub = engine.subscribe();
    let subscriber = sub.id();
    debug!(
        subscriber,
        phase = ?StreamPhase::Attaching,
        backlog = sub.backlog(),
        "catch-up queued"
    );
    debug!(subscriber, phase = ?StreamPhase::Streaming, "streaming");

    let mut delivered = 0u64;
    let mut requeued = None;
    let reason = loop {
        let pending = match timeout(event_timeout, sub.next()).await {
            Ok(Some(pending)) => pending,
            Ok(None) => break CloseReason::FeedClosed,
            Err(_) => match sink.probe(probe_timeout).await {
                Liveness::Alive => continue,
                Liveness::Gone => break CloseReason::ProbeFailed,
            },
        };

        let coord = pending.coord();
        let tile = match engine.render_tile(coord) {
            Ok(tile) => tile,
            Err(err) => {
                warn!(subscriber, %coord, %err, "could not render tile");
                pending.ack();
                continue;
            }
        };

        match sink.push(&tile).await {
            Ok(()) => {
                pending.ack();
                delivered += 1;
            }
            Err(SubscriberDisconnected) => {
                let reached = pending.requeue();
                warn!(subscriber, %coord, reached, "subscriber gone, requeued change");
                requeued = Some((coord, reached));
                break CloseReason::PushFailed;
            }
        }
    };

    info!(
        subscriber,
        phase = ?StreamPhase::Closing,
        ?reason,
        delivered,
        "subscriber detached"
    );
    StreamReport {
        delivered,
        reason,
        requeued,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::testing::{engine_with, toggle_to};
    use crate::TileState;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    /// Forwards tiles to the test; fails once the test drops its receiver.
    struct ChannelSink {
        tx: mpsc::UnboundedSender<(Coord, TileState)>,
    }

    impl TileSink for ChannelSink {
        async fn push(&mut self, tile: &RenderedTile) -> Result<(), SubscriberDisconnected> {
            self.tx
                .send((tile.coord, tile.state))
                .map_err(|_| SubscriberDisconnected)
        }

        async fn probe(&mut self, _wait: Duration) -> Liveness {
            if self.tx.is_closed() {
                Liveness::Gone
            } else {
                Liveness::Alive
            }
        }
    }

    /// Accepts a fixed number of pushes, then reports the viewer gone.
    struct FlakySink {
        remaining: usize,
        probes: usize,
    }

    impl TileSink for FlakySink {
        async fn push(&mut self, _tile: &RenderedTile) -> Result<(), SubscriberDisconnected> {
            if self.remaining == 0 {
                return Err(SubscriberDisconnected);
            }
            self.remaining -= 1;
            Ok(())
        }

        async fn probe(&mut self, _wait: Duration) -> Liveness {
            self.probes += 1;
            Liveness::Gone
        }
    }

    fn config(columns: u32, rows: u32) -> EngineConfig {
        EngineConfig {
            columns,
            rows,
            target: Some(1),
            bots_enabled: false,
            seed: Some(5),
            ..EngineConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_tile_catch_up_then_silence_then_live() {
        let engine = engine_with(config(1, 1), 3);
        let c = Coord::new(0, 0);
        toggle_to(&engine, c, 0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let mut sink = ChannelSink { tx };
                stream_changes(&engine, &mut sink).await
            })
        };

        assert_eq!(rx.recv().await, Some((c, 0)));
        assert!(tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .is_err());

        engine.toggle(&engine.run_id(), c).unwrap();
        assert_eq!(rx.recv().await, Some((c, 1)));

        drop(rx);
        engine.toggle(&engine.run_id(), c).unwrap();
        let report = task.await.unwrap();
        assert_eq!(report.delivered, 2);
        assert!(matches!(
            report.reason,
            CloseReason::PushFailed | CloseReason::ProbeFailed
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn catch_up_covers_every_tile_exactly_once() {
        let engine = engine_with(config(3, 2), 4);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let mut sink = ChannelSink { tx };
                stream_changes(&engine, &mut sink).await
            })
        };

        let mut seen = HashMap::new();
        for _ in 0..6 {
            let (coord, state) = rx.recv().await.unwrap();
            assert!(seen.insert(coord, state).is_none(), "{coord} sent twice");
        }
        let snapshot = engine.snapshot();
        for (coord, state) in &seen {
            assert_eq!(snapshot.get(*coord), Some(*state));
        }
        assert!(tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .is_err());

        engine.shutdown();
        let report = task.await.unwrap();
        assert_eq!(report.reason, CloseReason::FeedClosed);
        assert_eq!(report.delivered, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_push_is_requeued_for_another_viewer() {
        let engine = engine_with(config(2, 1), 3);
        let mut watcher = engine.subscribe();
        for _ in 0..2 {
            watcher.next().await.unwrap().ack();
        }

        let mut sink = FlakySink {
            remaining: 1,
            probes: 0,
        };
        let report = stream_changes(&engine, &mut sink).await;
        assert_eq!(report.reason, CloseReason::PushFailed);
        assert_eq!(report.delivered, 1);

        let (coord, reached) = report.requeued.unwrap();
        assert_eq!(reached, 1);
        let replay = watcher.next().await.unwrap();
        assert_eq!(replay.coord(), coord);
        replay.ack();
        assert_eq!(engine.subscriber_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_connection_is_probed_and_dropped() {
        let engine = engine_with(config(1, 1), 2);
        let mut sink = FlakySink {
            remaining: 1,
            probes: 0,
        };
        let report = stream_changes(&engine, &mut sink).await;
        assert_eq!(report.reason, CloseReason::ProbeFailed);
        assert_eq!(report.delivered, 1);
        assert_eq!(sink.probes, 1);
        assert_eq!(report.requeued, None);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_stream_requeues_in_flight_change() {
        struct StuckSink;

        impl TileSink for StuckSink {
            async fn push(&mut self, _tile: &RenderedTile) -> Result<(), SubscriberDisconnected> {
                std::future::pending::<()>().await;
                Ok(())
            }

            async fn probe(&mut self, _wait: Duration) -> Liveness {
                Liveness::Alive
            }
        }

        let engine = engine_with(config(1, 1), 2);
        let watcher = engine.subscribe();
        let mut sink = StuckSink;
        let cancelled =
            tokio::time::timeout(Duration::from_secs(1), stream_changes(&engine, &mut sink)).await;
        assert!(cancelled.is_err());

        // Catch-up entry plus the requeued in-flight change.
        assert_eq!(watcher.backlog(), 2);
        assert_eq!(engine.subscriber_count(), 1);
    }
}
