//! Non-blocking publish/subscribe fan-out for process output.
//!
//! The publisher is an output pump draining a child's pipe, so it must never
//! wait on a consumer: delivery uses `try_send`, and a record is dropped for
//! any subscriber whose channel is full (or gone).

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

/// Handle returned by [`Topic::subscribe`], used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    channels: Vec<(SubscriberId, mpsc::Sender<String>)>,
    closed: bool,
}

/// Fan-out of text records to a dynamic set of bounded channels.
///
/// A topic lives for one run of an app's process; after [`close`](Self::close)
/// every subscriber channel has been dropped by the topic, which ends the
/// receiving stream once the receiver drains what was already delivered.
#[derive(Default)]
pub struct Topic {
    subscribers: Mutex<Subscribers>,
}

impl Topic {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a channel. The topic takes ownership of the sender; keep the
    /// receiver and the returned id.
    ///
    /// Subscribing to a closed topic drops the sender straight away, so the
    /// receiver observes end-of-stream.
    pub fn subscribe(&self, channel: mpsc::Sender<String>) -> SubscriberId {
        let mut subs = self.lock();
        let id = SubscriberId(subs.next_id);
        subs.next_id += 1;
        if !subs.closed {
            subs.channels.push((id, channel));
        }
        id
    }

    /// Deliver `record` to every subscriber that has room for it.
    ///
    /// The subscriber set is copied under the lock and delivery happens after
    /// the lock is released. Returns how many subscribers received the record.
    pub fn publish(&self, record: &str) -> usize {
        let snapshot: Vec<mpsc::Sender<String>> = {
            let subs = self.lock();
            subs.channels.iter().map(|(_, tx)| tx.clone()).collect()
        };

        snapshot
            .iter()
            .filter(|tx| tx.try_send(record.to_owned()).is_ok())
            .count()
    }

    /// Remove a subscriber. Unknown ids are ignored; returns whether a
    /// subscriber was removed.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subs = self.lock();
        match subs.channels.iter().position(|(sid, _)| *sid == id) {
            Some(index) => {
                subs.channels.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// Drop every subscriber channel, signalling end-of-stream to all live
    /// readers.
    pub fn close(&self) {
        let channels = {
            let mut subs = self.lock();
            subs.closed = true;
            std::mem::take(&mut subs.channels)
        };
        drop(channels);
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().channels.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subs = self.lock();
        f.debug_struct("Topic")
            .field("subscribers", &subs.channels.len())
            .field("closed", &subs.closed)
            .finish()
    }
}
