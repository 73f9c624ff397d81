//! Overwriting ring buffer.
//!
//! A [`WheelBuffer`] is a fixed-capacity ring whose writer never blocks: when
//! every slot holds an unread record, the next write destroys the oldest one
//! and hands it back to the caller. Readers block on a condition variable
//! until a record arrives or the buffer is closed.
//!
//! The ring keeps no separate element count. `head` (oldest unread) and
//! `tail` (next write) share the same index space, and the slot under `head`
//! tells the two coincident-cursor cases apart:
//!
//! - empty: `head == tail` and the slot is unset
//! - full:  `head == tail` and the slot is set

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

/// Returned by reads and writes once the buffer is closed (and, for reads,
/// drained).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("buffer already closed")]
pub struct EndOfBuffer;

/// Outcome of a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Written<T> {
    /// The record went into a free slot.
    Stored,
    /// The buffer was full; the oldest unread record was destroyed to make
    /// room and is returned here so the caller can forward it elsewhere.
    Overwrote(T),
}

impl<T> Written<T> {
    pub fn is_overwrite(&self) -> bool {
        matches!(self, Written::Overwrote(_))
    }
}

struct Ring<T> {
    slots: Box<[Option<T>]>,
    head: usize,
    tail: usize,
    closed: bool,
}

impl<T> Ring<T> {
    fn is_empty(&self) -> bool {
        self.head == self.tail && self.slots[self.head].is_none()
    }

    fn is_full(&self) -> bool {
        self.head == self.tail && self.slots[self.tail].is_some()
    }

    fn advance(&self, cursor: usize) -> usize {
        (cursor + 1) % self.slots.len()
    }

    fn len(&self) -> usize {
        if self.is_full() {
            self.slots.len()
        } else {
            (self.tail + self.slots.len() - self.head) % self.slots.len()
        }
    }
}

/// Concurrency-safe overwrite-on-full circular buffer.
pub struct WheelBuffer<T> {
    ring: Mutex<Ring<T>>,
    readable: Condvar,
}

impl<T> WheelBuffer<T> {
    /// Create a buffer with `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "wheel buffer capacity must be non-zero");
        let slots = std::iter::repeat_with(|| None).take(capacity).collect();
        Self {
            ring: Mutex::new(Ring {
                slots,
                head: 0,
                tail: 0,
                closed: false,
            }),
            readable: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring<T>> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a record without ever blocking on readers.
    ///
    /// When the buffer is full the oldest unread record is overwritten, the
    /// read cursor moves past it and it is returned as
    /// [`Written::Overwrote`]. Writing into a closed buffer stores nothing.
    pub fn write(&self, value: T) -> Result<Written<T>, EndOfBuffer> {
        let outcome = {
            let mut ring = self.lock();
            if ring.closed {
                return Err(EndOfBuffer);
            }

            let outcome = if ring.is_full() {
                let tail = ring.tail;
                let destroyed = ring.slots[tail].take();
                ring.head = ring.advance(ring.head);
                destroyed.map_or(Written::Stored, Written::Overwrote)
            } else {
                Written::Stored
            };

            let tail = ring.tail;
            ring.slots[tail] = Some(value);
            ring.tail = ring.advance(tail);
            outcome
        };

        self.readable.notify_one();
        Ok(outcome)
    }

    /// Take the oldest unread record, blocking until one is available.
    ///
    /// After [`close`](Self::close) the remaining records are still handed
    /// out; once the buffer is both closed and empty this returns
    /// [`EndOfBuffer`].
    pub fn read(&self) -> Result<T, EndOfBuffer> {
        let mut ring = self.lock();
        while !ring.closed && ring.is_empty() {
            ring = self
                .readable
                .wait(ring)
                .unwrap_or_else(PoisonError::into_inner);
        }

        if ring.is_empty() {
            return Err(EndOfBuffer);
        }

        Ok(Self::take_head(&mut ring))
    }

    /// Non-blocking variant of [`read`](Self::read). `Ok(None)` means the
    /// buffer is open but currently empty.
    pub fn try_read(&self) -> Result<Option<T>, EndOfBuffer> {
        let mut ring = self.lock();
        if ring.is_empty() {
            return if ring.closed { Err(EndOfBuffer) } else { Ok(None) };
        }
        Ok(Some(Self::take_head(&mut ring)))
    }

    fn take_head(ring: &mut Ring<T>) -> T {
        let head = ring.head;
        let value = ring.slots[head].take();
        ring.head = ring.advance(head);
        // is_empty() was false, so the head slot was set.
        match value {
            Some(value) => value,
            None => unreachable!("non-empty wheel buffer with unset head slot"),
        }
    }

    /// Close the buffer and wake every blocked reader. Calling it again has
    /// no further effect.
    pub fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of unread records.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }
}

impl<T> std::fmt::Debug for WheelBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ring = self.lock();
        f.debug_struct("WheelBuffer")
            .field("capacity", &ring.slots.len())
            .field("len", &ring.len())
            .field("closed", &ring.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_round_trip_preserves_order() {
        let wheel = WheelBuffer::new(3);
        for s in ["a", "b", "c"] {
            assert_eq!(wheel.write(s.to_string()), Ok(Written::Stored));
        }
        assert_eq!(wheel.len(), 3);
        assert_eq!(wheel.read().unwrap(), "a");
        assert_eq!(wheel.read().unwrap(), "b");
        assert_eq!(wheel.read().unwrap(), "c");
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_overwrite_when_full_returns_oldest() {
        let wheel = WheelBuffer::new(2);
        assert_eq!(wheel.write("1".to_string()), Ok(Written::Stored));
        assert_eq!(wheel.write("2".to_string()), Ok(Written::Stored));

        let outcome = wheel.write("3".to_string()).unwrap();
        assert_eq!(outcome, Written::Overwrote("1".to_string()));
        assert!(outcome.is_overwrite());
        assert_eq!(wheel.len(), 2);

        assert_eq!(wheel.read().unwrap(), "2");
        assert_eq!(wheel.read().unwrap(), "3");
    }

    #[test]
    fn test_keeps_last_n_writes_after_many_overwrites() {
        let wheel = WheelBuffer::new(3);
        let mut destroyed = Vec::new();
        for i in 0..10 {
            if let Written::Overwrote(old) = wheel.write(i).unwrap() {
                destroyed.push(old);
            }
        }
        assert_eq!(destroyed, (0..7).collect::<Vec<_>>());
        assert_eq!(wheel.read().unwrap(), 7);
        assert_eq!(wheel.read().unwrap(), 8);
        assert_eq!(wheel.read().unwrap(), 9);
        assert_eq!(wheel.try_read(), Ok(None));
    }

    #[test]
    fn test_interleaved_reads_and_writes_wrap_around() {
        let wheel = WheelBuffer::new(2);
        wheel.write(1).unwrap();
        assert_eq!(wheel.read().unwrap(), 1);
        wheel.write(2).unwrap();
        wheel.write(3).unwrap();
        assert_eq!(wheel.len(), 2);
        assert_eq!(wheel.read().unwrap(), 2);
        wheel.write(4).unwrap();
        assert_eq!(wheel.read().unwrap(), 3);
        assert_eq!(wheel.read().unwrap(), 4);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_write_after_close_fails() {
        let wheel = WheelBuffer::new(2);
        wheel.close();
        assert_eq!(wheel.write("late"), Err(EndOfBuffer));
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_close_drains_remaining_before_end() {
        let wheel = WheelBuffer::new(4);
        wheel.write("x").unwrap();
        wheel.write("y").unwrap();
        wheel.close();
        wheel.close();
        assert!(wheel.is_closed());
        assert_eq!(wheel.read(), Ok("x"));
        assert_eq!(wheel.read(), Ok("y"));
        assert_eq!(wheel.read(), Err(EndOfBuffer));
        assert_eq!(wheel.try_read(), Err(EndOfBuffer));
    }

    #[test]
    fn test_blocked_reader_woken_by_write() {
        let wheel = Arc::new(WheelBuffer::new(1));
        let reader = {
            let wheel = Arc::clone(&wheel);
            thread::spawn(move || wheel.read())
        };
        thread::sleep(Duration::from_millis(50));
        wheel.write("wake".to_string()).unwrap();
        assert_eq!(reader.join().unwrap(), Ok("wake".to_string()));
    }

    #[test]
    fn test_all_blocked_readers_woken_by_close() {
        let wheel: Arc<WheelBuffer<String>> = Arc::new(WheelBuffer::new(1));
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let wheel = Arc::clone(&wheel);
                thread::spawn(move || wheel.read())
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        wheel.close();
        for reader in readers {
            assert_eq!(reader.join().unwrap(), Err(EndOfBuffer));
        }
    }

    #[test]
    fn test_concurrent_readers_account_for_every_write() {
        const TOTAL: usize = 5_000;
        let wheel = Arc::new(WheelBuffer::new(16));

        let writer = {
            let wheel = Arc::clone(&wheel);
            thread::spawn(move || {
                let mut overwritten = Vec::new();
                for i in 0..TOTAL {
                    if let Written::Overwrote(old) = wheel.write(i).unwrap() {
                        overwritten.push(old);
                    }
                    if i % 100 == 0 {
                        thread::yield_now();
                    }
                }
                wheel.close();
                overwritten
            })
        };

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let wheel = Arc::clone(&wheel);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Ok(v) = wheel.read() {
                        seen.push(v);
                    }
                    seen
                })
            })
            .collect();

        let overwritten = writer.join().unwrap();
        let mut all: Vec<usize> = overwritten.clone();
        for reader in readers {
            let seen = reader.join().unwrap();
            // Each reader observes records oldest-first.
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
            all.extend(seen);
        }

        assert_eq!(all.len(), TOTAL);
        let unique: HashSet<_> = all.into_iter().collect();
        assert_eq!(unique.len(), TOTAL);
    }

    #[test]
    #[should_panic(expected = "non-zero")]
    fn test_zero_capacity_panics() {
        let _ = WheelBuffer::<String>::new(0);
    }
}
