//! Reorder buffer (ROB)
//!
//! UDP may reorder or duplicate datagrams. The reorder buffer restores sequence order
//! before decoding:
//!
//! - the expected sequence number is emitted immediately, followed by any buffered
//!   successors that are now consecutive;
//! - numbers up to `window - 1` ahead are buffered until the gap closes;
//! - numbers further ahead (but in the forward half of the 8-bit space) mean the sender
//!   jumped: everything buffered is flushed and the buffer follows the sender;
//! - numbers behind the expected one are stale duplicates and are discarded.
//!
//! If nothing advances the expected number for `reset_timeout` while messages are
//! waiting, the buffer flushes what it holds (skipping the gaps) and resynchronises on
//! the next arrival. The buffer itself never reads the clock; callers pass `now`.

use crate::cancel::CancellationToken;
use crate::config::ReorderConfig;
use crate::connector::{Connector, DequeueError, EnqueueError};
use crate::stage::Stage;
use crate::types::{Result, TransportMessage};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SEQUENCE_SPACE: usize = 256;

/// Half of the sequence space; forward distances from here on count as "behind"
const FORWARD_HALF: u8 = 128;

/// Reorder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReorderStats {
    /// Messages released in order (including flushes)
    pub emitted: u64,
    /// Messages that arrived early and waited in the buffer
    pub buffered: u64,
    /// Early arrivals whose sequence number was already buffered
    pub duplicates: u64,
    /// Arrivals behind the expected sequence number
    pub stale: u64,
    /// Timeout flushes
    pub resets: u64,
    /// Arrivals beyond the disorder window
    pub jumps: u64,
}

/// Sequence-ordering state machine
pub struct ReorderBuffer {
    expected: Option<u8>,
    slots: Vec<Option<TransportMessage>>,
    pending: usize,
    window: u8,
    reset_timeout: Duration,
    // Start of the current wait for the expected sequence number
    stalled_since: Option<Instant>,
    stats: ReorderStats,
}

impl ReorderBuffer {
    pub fn new(config: &ReorderConfig) -> Self {
        Self {
            expected: config.initial_sequence,
            slots: (0..SEQUENCE_SPACE).map(|_| None).collect(),
            pending: 0,
            window: config.window.clamp(1, FORWARD_HALF),
            reset_timeout: config.reset_timeout,
            stalled_since: None,
            stats: ReorderStats::default(),
        }
    }

    /// Sequence number the buffer waits for, `None` until the next arrival
    pub fn expected(&self) -> Option<u8> {
        self.expected
    }

    /// Number of messages held back
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn stats(&self) -> ReorderStats {
        self.stats
    }

    /// Instant at which `poll_timeout` will force a flush
    pub fn next_deadline(&self) -> Option<Instant> {
        self.stalled_since.map(|start| start + self.reset_timeout)
    }

    /// Accept one message and return everything that can now be released, in order
    pub fn push(&mut self, message: TransportMessage, now: Instant) -> Vec<TransportMessage> {
        let mut out = Vec::new();
        let sequence = message.sequence_number;
        let expected = *self.expected.get_or_insert(sequence);
        let distance = sequence.wrapping_sub(expected);

        if distance == 0 {
            out.push(message);
            self.expected = Some(sequence.wrapping_add(1));
            self.drain_consecutive(&mut out);
            self.stalled_since = if self.pending > 0 { Some(now) } else { None };
        } else if distance < self.window {
            let slot = &mut self.slots[sequence as usize];
            if slot.is_some() {
                self.stats.duplicates += 1;
                log::trace!("Discarding duplicate of buffered sequence {}", sequence);
            } else {
                *slot = Some(message);
                self.pending += 1;
                self.stats.buffered += 1;
            }
            self.stalled_since.get_or_insert(now);
        } else if distance < FORWARD_HALF {
            self.stats.jumps += 1;
            log::warn!(
                "Sequence {} is {} ahead of expected {}, beyond the window of {}; resynchronising",
                sequence,
                distance,
                expected,
                self.window
            );
            self.flush_into(&mut out);
            out.push(message);
            self.expected = Some(sequence.wrapping_add(1));
            self.stalled_since = None;
        } else {
            self.stats.stale += 1;
            log::trace!("Discarding stale sequence {} (expected {})", sequence, expected);
            self.stalled_since.get_or_insert(now);
        }

        self.stats.emitted += out.len() as u64;
        out
    }

    /// Force a flush if the buffer has been stalled for the reset timeout
    pub fn poll_timeout(&mut self, now: Instant) -> Vec<TransportMessage> {
        let Some(deadline) = self.next_deadline() else {
            return Vec::new();
        };
        if now < deadline {
            return Vec::new();
        }

        let flushed = self.flush();
        self.stats.resets += 1;
        log::debug!(
            "No progress for {:?}, flushed {} buffered message(s) and waiting to resynchronise",
            self.reset_timeout,
            flushed.len()
        );
        flushed
    }

    /// Release every buffered message in sequence order and resynchronise on the next
    /// arrival
    pub fn flush(&mut self) -> Vec<TransportMessage> {
        let mut out = Vec::with_capacity(self.pending);
        self.flush_into(&mut out);
        self.expected = None;
        self.stalled_since = None;
        self.stats.emitted += out.len() as u64;
        out
    }

    fn drain_consecutive(&mut self, out: &mut Vec<TransportMessage>) {
        while let Some(expected) = self.expected {
            match self.slots[expected as usize].take() {
                Some(message) => {
                    out.push(message);
                    self.pending -= 1;
                    self.expected = Some(expected.wrapping_add(1));
                }
                None => break,
            }
        }
    }

    fn flush_into(&mut self, out: &mut Vec<TransportMessage>) {
        if self.pending == 0 {
            return;
        }
        let start = self.expected.unwrap_or(0);
        for offset in 0..SEQUENCE_SPACE {
            let index = start.wrapping_add(offset as u8) as usize;
            if let Some(message) = self.slots[index].take() {
                out.push(message);
            }
        }
        self.pending = 0;
    }
}

/// Single-worker stage wrapping a [`ReorderBuffer`]
pub struct ReorderStage {
    config: ReorderConfig,
    buffer: ReorderBuffer,
    input: Arc<Connector<TransportMessage>>,
    output: Arc<Connector<TransportMessage>>,
}

impl ReorderStage {
    pub fn new(
        input: Arc<Connector<TransportMessage>>,
        output: Arc<Connector<TransportMessage>>,
        config: ReorderConfig,
    ) -> Self {
        Self {
            buffer: ReorderBuffer::new(&config),
            config,
            input,
            output,
        }
    }

    pub fn stats(&self) -> ReorderStats {
        self.buffer.stats()
    }

    /// Returns false when the stage should stop
    fn forward(&self, messages: Vec<TransportMessage>, cancel: &CancellationToken) -> bool {
        for message in messages {
            match self.output.enqueue(message, cancel) {
                Ok(()) => {}
                Err(EnqueueError::Full(message)) => {
                    log::warn!(
                        "[{}] output connector full, dropping sequence {}",
                        self.config.stage.name,
                        message.sequence_number
                    );
                }
                Err(EnqueueError::Closed(_)) | Err(EnqueueError::Cancelled(_)) => return false,
            }
        }
        true
    }
}

impl Stage for ReorderStage {
    fn name(&self) -> &str {
        &self.config.stage.name
    }

    fn running_mode(&self) -> crate::config::RunningMode {
        self.config.stage.running_mode
    }

    fn init(&mut self) -> Result<()> {
        self.config.validate()
    }

    fn run(&mut self, cancel: &CancellationToken) {
        log::info!(
            "[{}] running with reset timeout {:?} and window {}",
            self.config.stage.name,
            self.config.reset_timeout,
            self.config.window
        );

        while !cancel.is_cancelled() {
            let now = Instant::now();
            let received = match self.buffer.next_deadline() {
                Some(deadline) if deadline <= now => {
                    let flushed = self.buffer.poll_timeout(now);
                    if !self.forward(flushed, cancel) {
                        break;
                    }
                    continue;
                }
                Some(deadline) => self.input.dequeue_timeout(cancel, deadline - now),
                None => self.input.dequeue(cancel),
            };

            match received {
                Ok(message) => {
                    let released = self.buffer.push(message, Instant::now());
                    if !self.forward(released, cancel) {
                        break;
                    }
                }
                Err(DequeueError::Timeout) => continue,
                Err(DequeueError::Closed) => {
                    let rest = self.buffer.flush();
                    self.forward(rest, cancel);
                    break;
                }
                Err(DequeueError::Cancelled) => break,
            }
        }

        self.output.close();
    }

    fn close(&mut self) {
        let stats = self.buffer.stats();
        log::info!(
            "[{}] closed: emitted={} buffered={} duplicates={} stale={} resets={} jumps={}",
            self.config.stage.name,
            stats.emitted,
            stats.buffered,
            stats.duplicates,
            stats.stale,
            stats.resets,
            stats.jumps
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RunningMode, StageConfig};

    fn msg(sequence: u8) -> TransportMessage {
        TransportMessage::new(sequence)
    }

    fn sequences(messages: &[TransportMessage]) -> Vec<u8> {
        messages.iter().map(|m| m.sequence_number).collect()
    }

    fn push_all(buffer: &mut ReorderBuffer, arrivals: &[u8], now: Instant) -> Vec<u8> {
        let mut emitted = Vec::new();
        for &sequence in arrivals {
            emitted.extend(sequences(&buffer.push(msg(sequence), now)));
        }
        emitted
    }

    #[test]
    fn test_in_order_passthrough() {
        let mut buffer = ReorderBuffer::new(&ReorderConfig::new());
        let emitted = push_all(&mut buffer, &[10, 11, 12], Instant::now());
        assert_eq!(emitted, vec![10, 11, 12]);
        assert_eq!(buffer.expected(), Some(13));
        assert_eq!(buffer.next_deadline(), None);
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut buffer = ReorderBuffer::new(&ReorderConfig::new());
        let emitted = push_all(&mut buffer, &[254, 255, 0, 1], Instant::now());
        assert_eq!(emitted, vec![254, 255, 0, 1]);
        assert_eq!(buffer.stats().stale, 0);
    }

    #[test]
    fn test_reordering_across_gap() {
        let config = ReorderConfig::new().with_initial_sequence(1);
        let mut buffer = ReorderBuffer::new(&config);
        let now = Instant::now();

        assert!(buffer.push(msg(3), now).is_empty());
        assert_eq!(buffer.pending(), 1);
        assert_eq!(sequences(&buffer.push(msg(1), now)), vec![1]);
        assert_eq!(buffer.expected(), Some(2));
        assert_eq!(sequences(&buffer.push(msg(2), now)), vec![2, 3]);
        assert_eq!(buffer.expected(), Some(4));
        assert_eq!(sequences(&buffer.push(msg(4), now)), vec![4]);
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_held_messages_keep_reception_time() {
        let config = ReorderConfig::new().with_initial_sequence(1);
        let mut buffer = ReorderBuffer::new(&config);
        let now = Instant::now();
        let early = chrono::Utc::now() - chrono::Duration::milliseconds(80);
        let late = early + chrono::Duration::milliseconds(50);

        assert!(buffer.push(msg(2).with_received_at(early), now).is_empty());
        let released = buffer.push(msg(1).with_received_at(late), now + Duration::from_millis(50));

        assert_eq!(sequences(&released), vec![1, 2]);
        assert_eq!(released[0].received_at, Some(late));
        assert_eq!(released[1].received_at, Some(early));
    }

    #[test]
    fn test_reordering_across_wrap() {
        let config = ReorderConfig::new().with_initial_sequence(254);
        let mut buffer = ReorderBuffer::new(&config);
        let emitted = push_all(&mut buffer, &[0, 255, 254, 1], Instant::now());
        assert_eq!(emitted, vec![254, 255, 0, 1]);
    }

    #[test]
    fn test_duplicates_and_stale_discarded() {
        let config = ReorderConfig::new().with_initial_sequence(5);
        let mut buffer = ReorderBuffer::new(&config);
        let emitted = push_all(&mut buffer, &[5, 7, 7, 4, 5, 6, 6, 8], Instant::now());

        assert_eq!(emitted, vec![5, 6, 7, 8]);
        let stats = buffer.stats();
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.stale, 3);
        assert_eq!(stats.emitted, 4);
    }

    #[test]
    fn test_stall_recovery_flushes_in_order() {
        let config = ReorderConfig::new()
            .with_initial_sequence(1)
            .with_reset_timeout(Duration::from_millis(100));
        let mut buffer = ReorderBuffer::new(&config);
        let start = Instant::now();

        assert!(buffer.push(msg(6), start).is_empty());
        assert!(buffer.push(msg(3), start).is_empty());
        assert_eq!(buffer.next_deadline(), Some(start + Duration::from_millis(100)));

        assert!(buffer.poll_timeout(start + Duration::from_millis(50)).is_empty());
        let flushed = buffer.poll_timeout(start + Duration::from_millis(100));
        assert_eq!(sequences(&flushed), vec![3, 6]);
        assert_eq!(buffer.expected(), None);
        assert_eq!(buffer.stats().resets, 1);

        let later = start + Duration::from_millis(120);
        assert_eq!(sequences(&buffer.push(msg(40), later)), vec![40]);
        assert_eq!(buffer.expected(), Some(41));
    }

    #[test]
    fn test_advance_restarts_stall_clock() {
        let config = ReorderConfig::new()
            .with_initial_sequence(0)
            .with_reset_timeout(Duration::from_millis(100));
        let mut buffer = ReorderBuffer::new(&config);
        let start = Instant::now();

        buffer.push(msg(2), start);
        let advanced_at = start + Duration::from_millis(80);
        assert_eq!(sequences(&buffer.push(msg(0), advanced_at)), vec![0]);

        // Still waiting for 1, but the clock restarted at the advance
        assert!(buffer.poll_timeout(start + Duration::from_millis(150)).is_empty());
        assert_eq!(sequences(&buffer.poll_timeout(advanced_at + Duration::from_millis(100))), vec![2]);
    }

    #[test]
    fn test_stale_arrivals_trigger_resync() {
        let config = ReorderConfig::new().with_initial_sequence(100);
        let mut buffer = ReorderBuffer::new(&config);
        let start = Instant::now();

        // A restarted sender looks like it is behind
        assert!(buffer.push(msg(0), start).is_empty());
        assert!(buffer.poll_timeout(start + Duration::from_millis(100)).is_empty());
        assert_eq!(buffer.expected(), None);
        assert_eq!(sequences(&buffer.push(msg(1), start + Duration::from_millis(101))), vec![1]);
    }

    #[test]
    fn test_jump_beyond_window_resynchronises() {
        let config = ReorderConfig::new().with_initial_sequence(10).with_window(8);
        let mut buffer = ReorderBuffer::new(&config);
        let now = Instant::now();

        assert!(buffer.push(msg(12), now).is_empty());
        assert_eq!(sequences(&buffer.push(msg(30), now)), vec![12, 30]);
        assert_eq!(buffer.expected(), Some(31));
        assert_eq!(buffer.stats().jumps, 1);
    }

    #[test]
    fn test_idle_buffer_has_no_deadline() {
        let mut buffer = ReorderBuffer::new(&ReorderConfig::new());
        assert!(buffer.poll_timeout(Instant::now() + Duration::from_secs(10)).is_empty());
        assert_eq!(buffer.stats().resets, 0);
    }

    #[test]
    fn test_stage_rejects_pool_mode() {
        let mut config = ReorderConfig::new();
        config.stage = StageConfig::new("rob").with_running_mode(RunningMode::Pool);
        let mut stage = ReorderStage::new(Arc::new(Connector::new(4)), Arc::new(Connector::new(4)), config);
        assert!(stage.init().is_err());
    }

    #[test]
    fn test_stage_orders_and_flushes_on_close() {
        let cancel = CancellationToken::new();
        let input = Arc::new(Connector::new(16));
        let output = Arc::new(Connector::new(16));
        for sequence in [0u8, 2, 1, 5] {
            input.enqueue(msg(sequence), &cancel).unwrap();
        }
        input.close();

        let mut stage = ReorderStage::new(Arc::clone(&input), Arc::clone(&output), ReorderConfig::new());
        stage.init().unwrap();
        stage.run(&cancel);
        stage.close();

        let mut emitted = Vec::new();
        while let Ok(message) = output.dequeue(&cancel) {
            emitted.push(message.sequence_number);
        }
        assert_eq!(emitted, vec![0, 1, 2, 5]);
    }

    #[test]
    fn test_stage_flushes_after_timeout() {
        let cancel = CancellationToken::new();
        let input = Arc::new(Connector::new(16));
        let output = Arc::new(Connector::new(16));
        let config = ReorderConfig::new()
            .with_initial_sequence(0)
            .with_reset_timeout(Duration::from_millis(20));

        input.enqueue(msg(3), &cancel).unwrap();
        let mut stage = ReorderStage::new(Arc::clone(&input), Arc::clone(&output), config);
        stage.init().unwrap();

        let handle = std::thread::spawn(move || {
            stage.run(&cancel);
        });

        let probe = CancellationToken::new();
        let flushed = output
            .dequeue_timeout(&probe, Duration::from_secs(2))
            .unwrap();
        assert_eq!(flushed.sequence_number, 3);

        input.close();
        handle.join().unwrap();
    }
}
