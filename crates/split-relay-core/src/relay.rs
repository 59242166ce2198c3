//! Relay coordination and split retry.
//!
//! A relayed connection runs one upload pipe and one download pipe
//! concurrently and waits until either terminates. When the failed
//! attempt matches the early-reset signature (port 443, bytes uploaded,
//! nothing downloaded, connection reset by peer, first flight still
//! buffered), the transfer is re-homed onto a fresh socket and the
//! first flight is re-sent split across two TCP segments, once.

use std::io;
use std::sync::Arc;

use rand::Rng;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::config::RelayConfig;
use crate::connect::Connector;
use crate::metrics::{MetricsSink, EVENT_EARLY_RESET};
use crate::pipe::{Direction, DuplexPipe, PipeHandle};
use crate::proxy::session::Endpoint;
use crate::stats::{ConnectionStats, HTTPS_PORT};

/// Plain-HTTP port, kept distinct in the transfer-summary bucketing.
pub const HTTP_PORT: u16 = 80;

// On retries, the first segment carries a random 32-64 bytes
// (inclusive), capped at half the buffered flight.
const MIN_SPLIT: usize = 32;
const MAX_SPLIT: usize = 64;

/// Block until either pipe terminates.
///
/// Pipe running state and stats stopped state should agree, but can
/// diverge if a worker dies without reporting; checking both rules out
/// a hang or a busy loop whichever signal is authoritative.
pub async fn await_pipes<W1, W2>(
    stats: &ConnectionStats,
    upload: &PipeHandle<W1>,
    download: &PipeHandle<W2>,
) where
    W1: AsyncWrite + Unpin + Send + 'static,
    W2: AsyncWrite + Unpin + Send + 'static,
{
    while upload.is_running() && download.is_running() && !stats.was_stopped() {
        stats.await_stop().await;
    }
}

/// Whether a failed attempt qualifies for the split retry.
///
/// All five conditions must hold: eligible port, nothing downloaded,
/// something uploaded, a peer reset as the terminal error, and the
/// first flight still buffered.
pub fn should_retry(
    port: u16,
    download_bytes: u64,
    upload_bytes: u64,
    error: Option<io::ErrorKind>,
    first_flight_buffered: bool,
) -> bool {
    port == HTTPS_PORT
        && download_bytes == 0
        && upload_bytes > 0
        && error == Some(io::ErrorKind::ConnectionReset)
        && first_flight_buffered
}

/// [`should_retry`] over a finished attempt's stats.
pub fn retry_eligible(stats: &ConnectionStats) -> bool {
    should_retry(
        stats.port(),
        stats.download_bytes(),
        stats.upload_bytes(),
        stats.error_kind(),
        stats.has_first_flight(),
    )
}

/// The first write never exceeds half the original request, so even a
/// short flight is split meaningfully.
fn split_point(limit: usize, buffered: usize) -> usize {
    limit.min(buffered / 2)
}

/// Outcome of one retry attempt; feeds the `early_reset` event.
#[derive(Debug)]
pub struct RetryOutcome {
    pub bytes_before_reset: u64,
    pub chunks_before_reset: u64,
    pub split: usize,
    pub succeeded: bool,
}

fn emit_early_reset(metrics: &dyn MetricsSink, outcome: &RetryOutcome) {
    metrics.emit(
        EVENT_EARLY_RESET,
        &[
            ("bytes", outcome.bytes_before_reset as i64),
            ("chunks", outcome.chunks_before_reset as i64),
            ("split", outcome.split as i64),
            ("retry", i64::from(outcome.succeeded)),
        ],
    );
}

async fn replay_first_flight<W>(
    writer: &mut W,
    first_flight: &[u8],
    split: usize,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&first_flight[..split]).await?;
    // Flush so the leading bytes leave in their own segment.
    writer.flush().await?;
    writer.write_all(&first_flight[split..]).await
}

/// Retry a reset connection, splitting the initial segment.
///
/// Opens a replacement socket, re-homes the still-running upload pipe's
/// write side onto it (its read side may be blocked in a client read
/// and is untouched), replays the buffered first flight as two writes,
/// and runs a fresh relay attempt with new stats. On success the
/// replayed bytes are folded into the new counters and the new stats
/// and download handle are returned; if the connect or the replay
/// fails, the retry is abandoned and the original failed stats come
/// back unchanged. Exactly one retry is ever attempted per connection.
pub async fn split_retry<C, SW>(
    connector: &C,
    endpoint: &Endpoint,
    upload: &PipeHandle<C::Write>,
    session_writer: Arc<AsyncMutex<SW>>,
    prev: Arc<ConnectionStats>,
    relay: &RelayConfig,
    metrics: &dyn MetricsSink,
) -> (Arc<ConnectionStats>, Option<PipeHandle<SW>>)
where
    C: Connector,
    SW: AsyncWrite + Unpin + Send + 'static,
{
    let first_flight = match prev.first_flight() {
        Some(bytes) if !bytes.is_empty() => bytes,
        _ => return (prev, None),
    };

    let limit = rand::thread_rng().gen_range(MIN_SPLIT..=MAX_SPLIT);
    let split = split_point(limit, first_flight.len());
    let mut outcome = RetryOutcome {
        bytes_before_reset: prev.upload_bytes(),
        chunks_before_reset: prev.upload_chunks(),
        split,
        succeeded: false,
    };

    let outbound = match connector.connect(endpoint, true).await {
        Ok(outbound) => outbound,
        Err(e) => {
            debug!("Retry connect to {} failed: {}", endpoint, e);
            emit_early_reset(metrics, &outcome);
            return (prev, None);
        }
    };

    // Future upload bytes go to the new socket; dropping the old
    // writer closes the failed socket's write half.
    let old_writer = upload.replace_destination(outbound.writer).await;
    drop(old_writer);

    {
        let destination = upload.destination();
        let mut writer = destination.lock().await;
        if let Err(e) = replay_first_flight(&mut *writer, &first_flight, split).await {
            debug!("First-flight replay to {} failed: {}", endpoint, e);
            emit_early_reset(metrics, &outcome);
            return (prev, None);
        }
    }

    debug!(
        "Replayed {} bytes to {} split at {}",
        first_flight.len(),
        endpoint,
        split
    );

    let stats = Arc::new(ConnectionStats::for_retry(endpoint.port));
    upload.add_observer(stats.clone());

    let mut download = DuplexPipe::with_shared_destination(
        Direction::Download,
        outbound.reader,
        session_writer,
    );
    download.set_buffer_size(relay.buffer_size);
    download.set_idle_timeout(relay.idle_timeout());
    download.add_observer(stats.clone());
    let download = download.start();

    await_pipes(&stats, upload, &download).await;

    // Account for the replayed segment.
    stats.add_replayed_upload(first_flight.len() as u64, 2);
    outcome.succeeded = stats.download_bytes() > 0;
    emit_early_reset(metrics, &outcome);

    (stats, Some(download))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[test]
    fn retry_requires_all_five_conditions() {
        let reset = Some(io::ErrorKind::ConnectionReset);
        assert!(should_retry(443, 0, 40, reset, true));

        assert!(!should_retry(80, 0, 40, reset, true));
        assert!(!should_retry(443, 5, 40, reset, true));
        assert!(!should_retry(443, 0, 0, reset, true));
        assert!(!should_retry(443, 0, 40, Some(io::ErrorKind::TimedOut), true));
        assert!(!should_retry(443, 0, 40, None, true));
        assert!(!should_retry(443, 0, 40, reset, false));
    }

    #[test]
    fn split_never_exceeds_half_the_flight() {
        assert_eq!(split_point(40, 50), 25);
        assert_eq!(split_point(25, 50), 25);
        assert_eq!(split_point(24, 50), 24);
        assert_eq!(split_point(64, 40), 20);
        for limit in MIN_SPLIT..=MAX_SPLIT {
            assert!(split_point(limit, 128) >= MIN_SPLIT);
            assert!(split_point(limit, 128) <= MAX_SPLIT);
            assert!(split_point(limit, 50) <= 25);
        }
    }

    #[tokio::test]
    async fn await_pipes_returns_when_a_direction_ends() {
        let (mut client, client_side) = duplex(256);
        let (server_side, mut server) = duplex(256);
        let (mut server_down, server_down_side) = duplex(256);
        let (client_down_side, mut client_down) = duplex(256);

        let stats = Arc::new(ConnectionStats::new(HTTPS_PORT));

        let upload = DuplexPipe::new(Direction::Upload, client_side, server_side);
        upload.add_observer(stats.clone());
        let download = DuplexPipe::new(Direction::Download, server_down_side, client_down_side);
        download.add_observer(stats.clone());
        let upload = upload.start();
        let download = download.start();

        client.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        server.read_exact(&mut buf).await.unwrap();

        server_down.write_all(b"response!").await.unwrap();
        let mut buf = [0u8; 9];
        client_down.read_exact(&mut buf).await.unwrap();

        drop(server_down);

        tokio::time::timeout(
            Duration::from_secs(1),
            await_pipes(&stats, &upload, &download),
        )
        .await
        .unwrap();

        assert!(stats.was_stopped());
        assert_eq!(stats.upload_bytes(), 7);
        assert_eq!(stats.download_bytes(), 9);
        assert!(!stats.has_first_flight());
        assert!(!retry_eligible(&stats));
    }
}
