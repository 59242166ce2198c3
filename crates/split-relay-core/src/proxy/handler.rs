//! Per-connection CONNECT handling.
//!
//! Resolves and connects the requested endpoint, replies to the client,
//! relays both directions until one terminates, decides whether the
//! failure qualifies for the split retry, and tears everything down.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::connect::Connector;
use crate::error::{Error, Result};
use crate::metrics::{MetricsSink, EVENT_BYTES};
use crate::pipe::{Direction, DuplexPipe, PipeHandle};
use crate::proxy::session::{Reply, Session};
use crate::relay::{await_pipes, retry_eligible, split_retry, HTTP_PORT};
use crate::stats::{ConnectionStats, HTTPS_PORT};

/// Relay one CONNECT session to completion and return the final
/// transfer stats.
///
/// Every exit path, including cancellation, releases both pipe workers
/// and both sockets. A connect failure is reported to the client with
/// the mapped SOCKS reply and produces no stats and no events.
pub async fn handle_connect<SR, SW, C>(
    mut session: Session<SR, SW>,
    connector: &C,
    relay: &RelayConfig,
    metrics: &dyn MetricsSink,
) -> Result<Arc<ConnectionStats>>
where
    SR: AsyncRead + Unpin + Send + 'static,
    SW: AsyncWrite + Unpin + Send + 'static,
    C: Connector,
{
    let endpoint = session.endpoint().clone();
    let session_id = session.id();

    let outbound = match connector.connect(&endpoint, false).await {
        Ok(outbound) => outbound,
        Err(e) => {
            let reply = Reply::for_connect_error(&e);
            debug!(
                "Session {} connect {} failed ({:?}): {}",
                session_id, endpoint, reply, e
            );
            session.write_reply(reply, None).await?;
            return Err(Error::Connect {
                endpoint: endpoint.to_string(),
                source: e,
            });
        }
    };

    session
        .write_reply(Reply::Succeeded, Some(outbound.local_addr))
        .await?;
    let (client_reader, client_writer) = session.into_streams();

    let mut stats = ConnectionStats::new(endpoint.port);
    stats.set_simulate_reset(relay.simulate_reset && endpoint.port == HTTPS_PORT);
    let mut stats = Arc::new(stats);

    let mut upload = DuplexPipe::new(Direction::Upload, client_reader, outbound.writer);
    upload.set_buffer_size(relay.buffer_size);
    upload.set_idle_timeout(relay.idle_timeout());
    upload.add_observer(stats.clone());

    let mut download = DuplexPipe::new(Direction::Download, outbound.reader, client_writer);
    download.set_buffer_size(relay.buffer_size);
    download.set_idle_timeout(relay.idle_timeout());
    download.add_observer(stats.clone());

    let upload = upload.start();
    let mut download = download.start();

    await_pipes(&stats, &upload, &download).await;

    if retry_eligible(&stats) {
        debug!(
            "Session {} hit an early reset on {}, retrying with a split first flight",
            session_id, endpoint
        );
        // Drop the failed socket's read half before re-homing the
        // upload onto its replacement.
        download.stop();
        download.abort();
        let session_writer = download.destination();
        let (new_stats, new_download) = split_retry(
            connector,
            &endpoint,
            &upload,
            session_writer,
            stats,
            relay,
            metrics,
        )
        .await;
        stats = new_stats;
        if let Some(handle) = new_download {
            download = handle;
        }
    }

    // Terminate and release both sockets; closing the sources is what
    // unblocks a pipe still stuck in a read.
    upload.stop();
    download.stop();
    upload.abort();
    download.abort();
    shutdown_destination(&upload).await;
    shutdown_destination(&download).await;

    info!(
        "Session {} closed: {} (up: {} bytes / {} chunks, down: {} bytes)",
        session_id,
        endpoint,
        stats.upload_bytes(),
        stats.upload_chunks(),
        stats.download_bytes()
    );

    if stats.started() {
        emit_transfer_summary(metrics, &stats);
    }

    Ok(stats)
}

async fn shutdown_destination<W>(handle: &PipeHandle<W>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let destination = handle.destination();
    let mut writer = destination.lock().await;
    let _ = writer.shutdown().await;
}

/// Report total transfer over the lifetime of a socket. Ports other
/// than HTTP and HTTPS are grouped into a single bucket; the duration
/// is only reported once measured.
fn emit_transfer_summary(metrics: &dyn MetricsSink, stats: &ConnectionStats) {
    let port = match stats.port() {
        HTTP_PORT | HTTPS_PORT => stats.port() as i64,
        _ => -1,
    };
    let mut fields = vec![("value", stats.total_bytes() as i64), ("port", port)];
    if let Some(duration) = stats.duration() {
        fields.push(("duration", duration.as_secs() as i64));
    }
    metrics.emit(EVENT_BYTES, &fields);
}
