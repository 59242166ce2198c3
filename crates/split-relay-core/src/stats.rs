//! Per-attempt transfer statistics and failure detection.
//!
//! [`ConnectionStats`] observes both pipes of one relay attempt. It is
//! written by the two pipe workers and read by the coordinator only
//! after the completion signal fires, once all writers are done; the
//! counters are atomics and the first-flight buffer and error slot sit
//! behind short-lived locks.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

use crate::pipe::{Direction, TransferObserver};

/// The first-flight buffer only ever holds the client's opening bytes.
pub const MAX_FIRST_FLIGHT: usize = 1024;

/// Destination port eligible for reset detection and split retry.
pub const HTTPS_PORT: u16 = 443;

/// One-shot completion signal.
///
/// Releases exactly once; a second release is a no-op. Safe to await
/// from multiple points, before or after release.
#[derive(Debug, Default)]
pub struct Completion {
    released: AtomicBool,
    notify: Notify,
}

impl Completion {
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_released() {
                return;
            }
            notified.await;
        }
    }
}

/// Metadata about one relay attempt: duration, per-direction transfer
/// counters, the buffered first flight, and the terminal error if any.
#[derive(Debug)]
pub struct ConnectionStats {
    port: u16,
    started_at: Mutex<Option<Instant>>,
    stopped_at: Mutex<Option<Instant>>,
    upload_bytes: AtomicU64,
    upload_chunks: AtomicU64,
    download_bytes: AtomicU64,
    first_flight: Mutex<Option<BytesMut>>,
    error: Mutex<Option<io::ErrorKind>>,
    completion: Completion,
    simulate_reset: bool,
}

impl ConnectionStats {
    /// Stats for a first attempt. The first-flight buffer is allocated
    /// only for signature-eligible destinations (port 443).
    pub fn new(port: u16) -> Self {
        let first_flight = if port == HTTPS_PORT {
            Some(BytesMut::with_capacity(MAX_FIRST_FLIGHT))
        } else {
            None
        };
        Self {
            port,
            started_at: Mutex::new(None),
            stopped_at: Mutex::new(None),
            upload_bytes: AtomicU64::new(0),
            upload_chunks: AtomicU64::new(0),
            download_bytes: AtomicU64::new(0),
            first_flight: Mutex::new(first_flight),
            error: Mutex::new(None),
            completion: Completion::default(),
            simulate_reset: false,
        }
    }

    /// Stats for a retry attempt: the split has already been spent, so
    /// no first flight is buffered.
    pub fn for_retry(port: u16) -> Self {
        let mut stats = Self::new(port);
        *stats.first_flight.get_mut().unwrap_or_else(|e| e.into_inner()) = None;
        stats
    }

    /// Synthesize an artificial reset after the first upload chunk.
    /// Deterministic failure injection for retry tests; never enabled
    /// in production.
    pub fn set_simulate_reset(&mut self, enabled: bool) {
        self.simulate_reset = enabled;
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn upload_bytes(&self) -> u64 {
        self.upload_bytes.load(Ordering::Acquire)
    }

    pub fn upload_chunks(&self) -> u64 {
        self.upload_chunks.load(Ordering::Acquire)
    }

    pub fn download_bytes(&self) -> u64 {
        self.download_bytes.load(Ordering::Acquire)
    }

    pub fn total_bytes(&self) -> u64 {
        self.upload_bytes() + self.download_bytes()
    }

    /// Terminal error kind, if the attempt ended in an I/O failure.
    pub fn error_kind(&self) -> Option<io::ErrorKind> {
        *self.error.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the first flight is still buffered.
    pub fn has_first_flight(&self) -> bool {
        self.first_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Snapshot of the buffered first flight. Read only after the
    /// completion signal, never concurrently with the pipe workers.
    pub fn first_flight(&self) -> Option<Bytes> {
        self.first_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|b| Bytes::copy_from_slice(b))
    }

    /// Whether the stats ever observed a pipe start.
    pub fn started(&self) -> bool {
        self.started_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn was_stopped(&self) -> bool {
        self.completion.is_released()
    }

    /// Block until the completion signal fires.
    pub async fn await_stop(&self) {
        self.completion.wait().await
    }

    /// Attempt duration; `Some` only once both pipes' start and stop
    /// instants were recorded.
    pub fn duration(&self) -> Option<Duration> {
        let started = (*self.started_at.lock().unwrap_or_else(|e| e.into_inner()))?;
        let stopped = (*self.stopped_at.lock().unwrap_or_else(|e| e.into_inner()))?;
        Some(stopped.saturating_duration_since(started))
    }

    /// Fold a replayed first flight into the counters so the totals
    /// reflect the whole logical transfer: the full buffered length,
    /// written as two chunks.
    pub fn add_replayed_upload(&self, bytes: u64, chunks: u64) {
        self.upload_bytes.fetch_add(bytes, Ordering::AcqRel);
        self.upload_chunks.fetch_add(chunks, Ordering::AcqRel);
    }

    fn append_first_flight(&self, chunk: &[u8]) {
        let mut guard = self.first_flight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(buffer) = guard.as_mut() {
            if buffer.len() + chunk.len() <= MAX_FIRST_FLIGHT {
                buffer.extend_from_slice(chunk);
            } else {
                // Past capacity the flight can no longer be replayed.
                *guard = None;
            }
        }
    }

    fn discard_first_flight(&self) {
        *self.first_flight.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl TransferObserver for ConnectionStats {
    fn on_start(&self, _direction: Direction) {
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    fn on_transfer(&self, direction: Direction, chunk: &[u8]) {
        if self.was_stopped() {
            return;
        }
        match direction {
            Direction::Download => {
                self.download_bytes
                    .fetch_add(chunk.len() as u64, Ordering::AcqRel);
                // A server response means the connection survived its
                // first flight; a retry is no longer useful.
                self.discard_first_flight();
            }
            Direction::Upload => {
                self.upload_bytes
                    .fetch_add(chunk.len() as u64, Ordering::AcqRel);
                self.upload_chunks.fetch_add(1, Ordering::AcqRel);
                self.append_first_flight(chunk);
                if self.simulate_reset {
                    self.on_error(
                        direction,
                        &io::Error::new(
                            io::ErrorKind::ConnectionReset,
                            "simulated connection reset",
                        ),
                    );
                    self.on_stop(direction);
                }
            }
        }
    }

    fn on_error(&self, _direction: Direction, error: &io::Error) {
        *self.error.lock().unwrap_or_else(|e| e.into_inner()) = Some(error.kind());
    }

    fn on_stop(&self, _direction: Direction) {
        *self.stopped_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        self.completion.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_flight_allocated_only_for_https() {
        assert!(ConnectionStats::new(443).has_first_flight());
        assert!(!ConnectionStats::new(80).has_first_flight());
        assert!(!ConnectionStats::for_retry(443).has_first_flight());
    }

    #[test]
    fn download_discards_first_flight() {
        let stats = ConnectionStats::new(443);
        stats.on_transfer(Direction::Upload, b"GET /");
        assert!(stats.has_first_flight());

        stats.on_transfer(Direction::Download, b"x");
        assert!(!stats.has_first_flight());
        assert_eq!(stats.download_bytes(), 1);
        assert_eq!(stats.upload_bytes(), 5);
    }

    #[test]
    fn overflow_discards_buffer_but_not_counters() {
        let stats = ConnectionStats::new(443);
        stats.on_transfer(Direction::Upload, &[0u8; 600]);
        assert!(stats.has_first_flight());

        stats.on_transfer(Direction::Upload, &[0u8; 600]);
        assert!(!stats.has_first_flight());
        assert_eq!(stats.upload_bytes(), 1200);
        assert_eq!(stats.upload_chunks(), 2);
    }

    #[test]
    fn stop_releases_once() {
        let stats = ConnectionStats::new(443);
        assert!(!stats.was_stopped());
        stats.on_stop(Direction::Upload);
        stats.on_stop(Direction::Download);
        assert!(stats.was_stopped());
    }

    #[tokio::test]
    async fn await_stop_returns_after_release() {
        let stats = ConnectionStats::new(80);
        stats.on_start(Direction::Upload);
        stats.on_stop(Direction::Upload);
        tokio::time::timeout(Duration::from_secs(1), stats.await_stop())
            .await
            .unwrap();
        assert!(stats.duration().is_some());
    }

    #[tokio::test]
    async fn completion_wakes_a_waiter() {
        let stats = std::sync::Arc::new(ConnectionStats::new(80));
        let waiter = {
            let stats = stats.clone();
            tokio::spawn(async move { stats.await_stop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        stats.on_stop(Direction::Download);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn duration_requires_both_instants() {
        let stats = ConnectionStats::new(80);
        assert!(stats.duration().is_none());
        stats.on_start(Direction::Upload);
        assert!(stats.duration().is_none());
        stats.on_stop(Direction::Upload);
        assert!(stats.duration().is_some());
    }

    #[test]
    fn simulated_reset_stops_after_first_upload_chunk() {
        let mut stats = ConnectionStats::new(443);
        stats.set_simulate_reset(true);

        stats.on_transfer(Direction::Upload, &[7u8; 40]);
        assert!(stats.was_stopped());
        assert_eq!(stats.error_kind(), Some(io::ErrorKind::ConnectionReset));
        assert!(stats.has_first_flight());
        assert_eq!(stats.upload_bytes(), 40);

        // Later events from the still-running pipes are ignored.
        stats.on_transfer(Direction::Download, b"late");
        assert_eq!(stats.download_bytes(), 0);
    }

    #[test]
    fn replay_fold_reconciles_counters() {
        let stats = ConnectionStats::for_retry(443);
        stats.on_transfer(Direction::Upload, b"more");
        stats.add_replayed_upload(40, 2);
        assert_eq!(stats.upload_bytes(), 44);
        assert_eq!(stats.upload_chunks(), 3);
    }
}
