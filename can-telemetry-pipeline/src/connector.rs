//! Bounded FIFO connector between two stages
//!
//! A connector links exactly one producer stage to one consumer stage. It is backed by a
//! bounded crossbeam channel, so the number of enqueued-but-not-dequeued items can never
//! exceed the capacity. A full connector blocks its producer, pushing backpressure
//! upstream instead of dropping data.

use crate::cancel::CancellationToken;
use crossbeam_channel::{select, Receiver, Select, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;

/// Behaviour of `enqueue` when the connector is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EnqueueMode {
    /// Wait for the consumer to make room
    #[default]
    Block,
    /// Fail immediately with `EnqueueError::Full`
    Fail,
}

/// Enqueue failure; the rejected item is handed back
#[derive(PartialEq, Eq)]
pub enum EnqueueError<T> {
    Full(T),
    Closed(T),
    Cancelled(T),
}

impl<T> EnqueueError<T> {
    pub fn into_inner(self) -> T {
        match self {
            EnqueueError::Full(item) | EnqueueError::Closed(item) | EnqueueError::Cancelled(item) => item,
        }
    }
}

impl<T> fmt::Debug for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::Full(_) => f.write_str("Full(..)"),
            EnqueueError::Closed(_) => f.write_str("Closed(..)"),
            EnqueueError::Cancelled(_) => f.write_str("Cancelled(..)"),
        }
    }
}

impl<T> fmt::Display for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::Full(_) => f.write_str("connector is full"),
            EnqueueError::Closed(_) => f.write_str("connector is closed"),
            EnqueueError::Cancelled(_) => f.write_str("enqueue cancelled"),
        }
    }
}

impl<T> std::error::Error for EnqueueError<T> {}

/// Dequeue failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DequeueError {
    #[error("connector is closed and drained")]
    Closed,
    #[error("dequeue cancelled")]
    Cancelled,
    #[error("dequeue timed out")]
    Timeout,
}

/// Bounded single-producer/single-consumer-stage queue
pub struct Connector<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
    mode: EnqueueMode,
    // Dropped on close; `closed_rx` then becomes ready forever.
    closed_tx: Mutex<Option<Sender<()>>>,
    closed_rx: Receiver<()>,
}

impl<T> Connector<T> {
    /// Create a blocking connector. A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        Self::with_mode(capacity, EnqueueMode::Block)
    }

    /// Create a connector that fails instead of blocking when full
    pub fn non_blocking(capacity: usize) -> Self {
        Self::with_mode(capacity, EnqueueMode::Fail)
    }

    pub fn with_mode(capacity: usize, mode: EnqueueMode) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        let (closed_tx, closed_rx) = crossbeam_channel::bounded(0);
        Self {
            tx,
            rx,
            capacity,
            mode,
            closed_tx: Mutex::new(Some(closed_tx)),
            closed_rx,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items waiting to be dequeued
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed_tx.lock().is_none()
    }

    /// Close the connector. Items already enqueued can still be dequeued.
    pub fn close(&self) {
        self.closed_tx.lock().take();
    }

    /// Enqueue without blocking
    pub fn try_enqueue(&self, item: T) -> Result<(), EnqueueError<T>> {
        if self.is_closed() {
            return Err(EnqueueError::Closed(item));
        }
        self.tx.try_send(item).map_err(|e| match e {
            TrySendError::Full(item) => EnqueueError::Full(item),
            TrySendError::Disconnected(item) => EnqueueError::Closed(item),
        })
    }

    /// Enqueue an item, honoring the connector's full-queue mode
    pub fn enqueue(&self, item: T, cancel: &CancellationToken) -> Result<(), EnqueueError<T>> {
        if cancel.is_cancelled() {
            return Err(EnqueueError::Cancelled(item));
        }
        let item = match self.try_enqueue(item) {
            Ok(()) => return Ok(()),
            Err(EnqueueError::Full(item)) if self.mode == EnqueueMode::Block => item,
            Err(e) => return Err(e),
        };

        let mut sel = Select::new();
        let send_idx = sel.send(&self.tx);
        let closed_idx = sel.recv(&self.closed_rx);
        let cancel_idx = sel.recv(cancel.receiver());

        let oper = sel.select();
        match oper.index() {
            i if i == send_idx => oper
                .send(&self.tx, item)
                .map_err(|e| EnqueueError::Closed(e.into_inner())),
            i if i == closed_idx => {
                let _ = oper.recv(&self.closed_rx);
                Err(EnqueueError::Closed(item))
            }
            i if i == cancel_idx => {
                let _ = oper.recv(cancel.receiver());
                Err(EnqueueError::Cancelled(item))
            }
            _ => unreachable!("select returned an unregistered operation"),
        }
    }

    /// Block until an item is available, the connector is closed and drained, or the
    /// token is cancelled
    pub fn dequeue(&self, cancel: &CancellationToken) -> Result<T, DequeueError> {
        select! {
            recv(self.rx) -> item => item.map_err(|_| DequeueError::Closed),
            recv(self.closed_rx) -> _ => self.drain_one(),
            recv(cancel.receiver()) -> _ => Err(DequeueError::Cancelled),
        }
    }

    /// Like `dequeue`, but gives up after `timeout`
    pub fn dequeue_timeout(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<T, DequeueError> {
        select! {
            recv(self.rx) -> item => item.map_err(|_| DequeueError::Closed),
            recv(self.closed_rx) -> _ => self.drain_one(),
            recv(cancel.receiver()) -> _ => Err(DequeueError::Cancelled),
            default(timeout) => Err(DequeueError::Timeout),
        }
    }

    fn drain_one(&self) -> Result<T, DequeueError> {
        match self.rx.try_recv() {
            Ok(item) => Ok(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Err(DequeueError::Closed),
        }
    }
}

impl<T> fmt::Debug for Connector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("mode", &self.mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_fifo_order() {
        let cancel = CancellationToken::new();
        let connector = Connector::new(8);

        for i in 0..5 {
            connector.enqueue(i, &cancel).unwrap();
        }
        let drained: Vec<i32> = (0..5).map(|_| connector.dequeue(&cancel).unwrap()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_non_blocking_full() {
        let cancel = CancellationToken::new();
        let connector = Connector::non_blocking(2);

        connector.enqueue(1, &cancel).unwrap();
        connector.enqueue(2, &cancel).unwrap();
        assert_eq!(connector.enqueue(3, &cancel), Err(EnqueueError::Full(3)));
        assert_eq!(connector.len(), 2);

        assert_eq!(connector.dequeue(&cancel), Ok(1));
        connector.enqueue(3, &cancel).unwrap();
        assert_eq!(connector.len(), 2);
    }

    #[test]
    fn test_blocking_enqueue_waits_for_room() {
        let cancel = CancellationToken::new();
        let connector = Arc::new(Connector::new(1));
        connector.enqueue(1, &cancel).unwrap();

        let producer = {
            let connector = Arc::clone(&connector);
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                let start = Instant::now();
                connector.enqueue(2, &cancel).unwrap();
                start.elapsed()
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(connector.len(), 1);
        assert_eq!(connector.dequeue(&cancel), Ok(1));

        let waited = producer.join().unwrap();
        assert!(waited >= Duration::from_millis(40));
        assert_eq!(connector.dequeue(&cancel), Ok(2));
    }

    #[test]
    fn test_close_drains_remaining_items() {
        let cancel = CancellationToken::new();
        let connector = Connector::new(4);
        connector.enqueue("a", &cancel).unwrap();
        connector.enqueue("b", &cancel).unwrap();

        connector.close();
        connector.close();

        assert!(matches!(connector.enqueue("c", &cancel), Err(EnqueueError::Closed("c"))));
        assert_eq!(connector.dequeue(&cancel), Ok("a"));
        assert_eq!(connector.dequeue(&cancel), Ok("b"));
        assert_eq!(connector.dequeue(&cancel), Err(DequeueError::Closed));
    }

    #[test]
    fn test_close_wakes_blocked_consumer() {
        let cancel = CancellationToken::new();
        let connector: Arc<Connector<u8>> = Arc::new(Connector::new(1));

        let consumer = {
            let connector = Arc::clone(&connector);
            let cancel = cancel.clone();
            std::thread::spawn(move || connector.dequeue(&cancel))
        };

        std::thread::sleep(Duration::from_millis(20));
        connector.close();
        assert_eq!(consumer.join().unwrap(), Err(DequeueError::Closed));
    }

    #[test]
    fn test_cancel_wakes_blocked_producer() {
        let cancel = CancellationToken::new();
        let connector = Arc::new(Connector::new(1));
        connector.enqueue(0u32, &cancel).unwrap();

        let producer = {
            let connector = Arc::clone(&connector);
            let cancel = cancel.clone();
            std::thread::spawn(move || connector.enqueue(7, &cancel))
        };

        std::thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        let result = producer.join().unwrap();
        assert_eq!(result.map_err(EnqueueError::into_inner), Err(7));
        assert_eq!(connector.len(), 1);
    }

    #[test]
    fn test_dequeue_timeout() {
        let cancel = CancellationToken::new();
        let connector: Connector<u8> = Connector::new(1);
        assert_eq!(
            connector.dequeue_timeout(&cancel, Duration::from_millis(5)),
            Err(DequeueError::Timeout)
        );

        cancel.cancel();
        assert_eq!(connector.dequeue(&cancel), Err(DequeueError::Cancelled));
    }

    #[test]
    fn test_outstanding_never_exceeds_capacity() {
        let cancel = CancellationToken::new();
        let connector = Arc::new(Connector::new(4));

        let producer = {
            let connector = Arc::clone(&connector);
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                for i in 0..200u32 {
                    assert!(connector.len() <= connector.capacity());
                    connector.enqueue(i, &cancel).unwrap();
                }
                connector.close();
            })
        };

        let mut received = Vec::new();
        while let Ok(item) = connector.dequeue(&cancel) {
            assert!(connector.len() <= 4);
            received.push(item);
        }
        producer.join().unwrap();
        assert_eq!(received, (0..200).collect::<Vec<_>>());
    }
}
