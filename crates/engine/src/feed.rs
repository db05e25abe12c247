//! Change notification feed.
//!
//! Every successful toggle publishes its coordinate here. Each subscriber
//! owns an unbounded queue created at attach time, so a slow or departed
//! subscriber can never take an event meant for another one.

use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

use crate::grid::Coord;

pub type SubscriberId = u64;

#[derive(Debug, Default)]
pub struct ChangeFeed {
    inner: Mutex<FeedInner>,
}

#[derive(Debug, Default)]
struct FeedInner {
    next_id: SubscriberId,
    closed: bool,
    subscribers: Vec<(SubscriberId, mpsc::UnboundedSender<Coord>)>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FeedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fans a change out to every attached subscriber. Returns how many
    /// queues received it.
    pub fn publish(&self, coord: Coord) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|(_, tx)| tx.send(coord).is_ok());
        inner.subscribers.len()
    }

    /// Opens a fresh queue preloaded with `catch_up`, in order, ahead of any
    /// live change published afterwards.
    pub fn subscribe(&self, catch_up: impl IntoIterator<Item = Coord>) -> Subscription<'_> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        if !inner.closed {
            for coord in catch_up {
                // The receiver is alive in this scope.
                let _ = tx.send(coord);
            }
            inner.subscribers.push((id, tx));
        }

        Subscription { feed: self, id, rx }
    }

    /// Hands an undelivered change to every other subscriber.
    pub fn requeue(&self, from: SubscriberId, coord: Coord) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|(_, tx)| !tx.is_closed());
        let mut reached = 0;
        for (id, tx) in &inner.subscribers {
            if *id != from && tx.send(coord).is_ok() {
                reached += 1;
            }
        }
        reached
    }

    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|(_, tx)| !tx.is_closed());
        inner.subscribers.len()
    }

    /// Drops every queue; subscribers see the end of their stream once they
    /// drain what is left.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }

    fn detach(&self, id: SubscriberId) {
        self.lock().subscribers.retain(|(sid, _)| *sid != id);
    }
}

/// One subscriber's private queue. Detaches from the feed on drop.
#[derive(Debug)]
pub struct Subscription<'a> {
    feed: &'a ChangeFeed,
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<Coord>,
}

impl<'a> Subscription<'a> {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Waits for the next change. Cancel safe: abandoning the wait loses
    /// nothing.
    pub async fn next(&mut self) -> Option<Pending<'a>> {
        let coord = self.rx.recv().await?;
        Some(Pending {
            feed: self.feed,
            from: self.id,
            coord,
            settled: false,
        })
    }

    /// Number of changes already queued for this subscriber.
    pub fn backlog(&self) -> usize {
        self.rx.len()
    }
}

impl Drop for Subscription<'_> {
    fn drop(&mut self) {
        self.feed.detach(self.id);
    }
}

/// A change taken off a subscriber's queue but not yet delivered.
///
/// Dropping it without `ack` requeues the change to the other subscribers,
/// which covers a stream being cancelled mid-push.
#[derive(Debug)]
pub struct Pending<'a> {
    feed: &'a ChangeFeed,
    from: SubscriberId,
    coord: Coord,
    settled: bool,
}

impl Pending<'_> {
    pub fn coord(&self) -> Coord {
        self.coord
    }

    pub fn ack(mut self) {
        self.settled = true;
    }

    /// Returns the number of other subscribers that received the change.
    pub fn requeue(mut self) -> usize {
        self.settled = true;
        self.feed.requeue(self.from, self.coord)
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let reached = self.feed.requeue(self.from, self.coord);
            debug!(
                column = self.coord.column,
                row = self.coord.row,
                reached,
                "requeued change dropped in flight"
            );
        }
    }
}
