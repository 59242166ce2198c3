//! Unidirectional byte pipes.
//!
//! A [`DuplexPipe`] moves bytes from a source stream to a destination
//! stream until the source is exhausted or either side fails, reporting
//! start, per-chunk transfer, error, and stop events to registered
//! [`TransferObserver`]s. Two pipes compose one bidirectional tunnel.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Default per-read buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Direction of a pipe within a proxied connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to destination server.
    Upload,
    /// Destination server to client.
    Download,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events reported by a running pipe.
///
/// `on_start` precedes any `on_transfer` from the same pipe; events from
/// a single pipe are sequential; `on_stop` is the final event and fires
/// at most once. `on_error`, when it fires, precedes `on_stop`.
/// Implementations must not block: they are invoked inline on the pipe
/// worker.
pub trait TransferObserver: Send + Sync {
    fn on_start(&self, direction: Direction) {
        let _ = direction;
    }

    fn on_transfer(&self, direction: Direction, chunk: &[u8]);

    fn on_error(&self, direction: Direction, error: &io::Error) {
        let _ = (direction, error);
    }

    fn on_stop(&self, direction: Direction) {
        let _ = direction;
    }
}

type ObserverList = Arc<Mutex<Vec<Arc<dyn TransferObserver>>>>;
type SharedWriter<W> = Arc<AsyncMutex<W>>;

fn for_each_observer(observers: &ObserverList, f: impl Fn(&dyn TransferObserver)) {
    let observers = observers.lock().unwrap_or_else(|e| e.into_inner());
    for observer in observers.iter() {
        f(observer.as_ref());
    }
}

/// One direction of a relayed connection, not yet started.
pub struct DuplexPipe<R, W> {
    direction: Direction,
    source: R,
    destination: SharedWriter<W>,
    buffer_size: usize,
    idle_timeout: Option<Duration>,
    running: Arc<AtomicBool>,
    observers: ObserverList,
}

impl<R, W> DuplexPipe<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Create a pipe that owns its destination stream.
    pub fn new(direction: Direction, source: R, destination: W) -> Self {
        Self::with_shared_destination(direction, source, Arc::new(AsyncMutex::new(destination)))
    }

    /// Create a pipe onto an already-shared destination.
    ///
    /// Used by the retry path, which builds a replacement download pipe
    /// onto the same client-side writer the failed attempt used.
    pub fn with_shared_destination(
        direction: Direction,
        source: R,
        destination: SharedWriter<W>,
    ) -> Self {
        Self {
            direction,
            source,
            destination,
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: None,
            running: Arc::new(AtomicBool::new(false)),
            observers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_buffer_size(&mut self, buffer_size: usize) {
        self.buffer_size = buffer_size;
    }

    /// Bound each read; an expired timeout is a clean stop.
    pub fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = Some(timeout);
    }

    pub fn add_observer(&self, observer: Arc<dyn TransferObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Spawn the pipe worker and return its control handle.
    pub fn start(self) -> PipeHandle<W> {
        self.running.store(true, Ordering::Release);
        PipeHandle {
            direction: self.direction,
            running: Arc::clone(&self.running),
            destination: Arc::clone(&self.destination),
            observers: Arc::clone(&self.observers),
            task: tokio::spawn(run_pipe(self)),
        }
    }
}

async fn run_pipe<R, W>(mut pipe: DuplexPipe<R, W>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let direction = pipe.direction;
    let observers = Arc::clone(&pipe.observers);
    for_each_observer(&observers, |o| o.on_start(direction));

    let mut buf = vec![0u8; pipe.buffer_size];
    let error = loop {
        if !pipe.running.load(Ordering::Acquire) {
            break None;
        }

        let read = match pipe.idle_timeout {
            Some(idle) => {
                match tokio::time::timeout(idle, pipe.source.read(&mut buf)).await {
                    Ok(read) => read,
                    Err(_) => {
                        debug!("{} pipe idle for {:?}, stopping", direction, idle);
                        break None;
                    }
                }
            }
            None => pipe.source.read(&mut buf).await,
        };

        match read {
            Ok(0) => break None,
            Ok(n) => {
                trace!("{} pipe transferring {} bytes", direction, n);
                for_each_observer(&observers, |o| o.on_transfer(direction, &buf[..n]));
                let mut destination = pipe.destination.lock().await;
                if let Err(e) = destination.write_all(&buf[..n]).await {
                    break Some(e);
                }
            }
            Err(e) => break Some(e),
        }
    };

    if let Some(error) = &error {
        debug!("{} pipe error: {}", direction, error);
        for_each_observer(&observers, |o| o.on_error(direction, error));
    }
    pipe.running.store(false, Ordering::Release);
    for_each_observer(&observers, |o| o.on_stop(direction));
}

/// Control handle for a started pipe.
///
/// Dropping the handle aborts the worker, so cancelling a connection
/// task releases both of its pipes.
pub struct PipeHandle<W> {
    direction: Direction,
    running: Arc<AtomicBool>,
    destination: SharedWriter<W>,
    observers: ObserverList,
    task: JoinHandle<()>,
}

impl<W> PipeHandle<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Request termination.
    ///
    /// Binds before the pipe's next read; an in-flight read is never
    /// interrupted, so a pipe blocked on an idle source stays blocked
    /// until the source closes or [`abort`](Self::abort) drops it. No
    /// write is issued after the worker observes the request. Once
    /// stopped, a pipe never restarts. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Drop the worker together with its source stream.
    ///
    /// Closing the source is the only way to unblock a pipe stuck in a
    /// read; used during final teardown, after [`stop`](Self::stop).
    /// Observers receive no further events.
    pub fn abort(&self) {
        self.running.store(false, Ordering::Release);
        self.task.abort();
    }

    /// Attach an observer; legal on a running pipe.
    pub fn add_observer(&self, observer: Arc<dyn TransferObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Swap the destination for subsequent writes and return the old
    /// one so the caller can close it.
    ///
    /// Safe while the pipe is blocked in a read; the swap takes effect
    /// on the pipe's next write. Never call concurrently with another
    /// swap.
    pub async fn replace_destination(&self, destination: W) -> W {
        std::mem::replace(&mut *self.destination.lock().await, destination)
    }

    /// Shared handle to the current destination.
    pub fn destination(&self) -> SharedWriter<W> {
        Arc::clone(&self.destination)
    }

    /// Wait for the worker to finish on its own.
    pub async fn join(&mut self) {
        let _ = (&mut self.task).await;
    }
}

impl<W> Drop for PipeHandle<W> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[derive(Default)]
    struct EventLog {
        events: Mutex<Vec<String>>,
    }

    impl EventLog {
        fn snapshot(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl TransferObserver for EventLog {
        fn on_start(&self, direction: Direction) {
            self.events.lock().unwrap().push(format!("start:{}", direction));
        }

        fn on_transfer(&self, direction: Direction, chunk: &[u8]) {
            self.events
                .lock()
                .unwrap()
                .push(format!("transfer:{}:{}", direction, chunk.len()));
        }

        fn on_error(&self, direction: Direction, _error: &io::Error) {
            self.events.lock().unwrap().push(format!("error:{}", direction));
        }

        fn on_stop(&self, direction: Direction) {
            self.events.lock().unwrap().push(format!("stop:{}", direction));
        }
    }

    #[tokio::test]
    async fn relays_bytes_and_reports_events_in_order() {
        let (mut client, source) = duplex(64);
        let (sink, mut received) = duplex(64);

        let log = Arc::new(EventLog::default());
        let pipe = DuplexPipe::new(Direction::Upload, source, sink);
        pipe.add_observer(log.clone());
        let mut handle = pipe.start();

        client.write_all(b"hello").await.unwrap();
        drop(client);

        tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .unwrap();

        let mut buf = [0u8; 5];
        received.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        assert_eq!(
            log.snapshot(),
            vec!["start:upload", "transfer:upload:5", "stop:upload"]
        );
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn reports_error_before_stop_when_destination_closes() {
        let (mut client, source) = duplex(64);
        let (sink, received) = duplex(64);
        drop(received);

        let log = Arc::new(EventLog::default());
        let pipe = DuplexPipe::new(Direction::Download, source, sink);
        pipe.add_observer(log.clone());
        let mut handle = pipe.start();

        client.write_all(b"data").await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .unwrap();

        assert_eq!(
            log.snapshot(),
            vec![
                "start:download",
                "transfer:download:4",
                "error:download",
                "stop:download"
            ]
        );
    }

    #[tokio::test]
    async fn destination_swap_takes_effect_on_next_write() {
        let (mut client, source) = duplex(64);
        let (old_sink, mut old_received) = duplex(64);
        let (new_sink, mut new_received) = duplex(64);

        let pipe = DuplexPipe::new(Direction::Upload, source, old_sink);
        let mut handle = pipe.start();

        client.write_all(b"one").await.unwrap();
        let mut buf = [0u8; 3];
        old_received.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one");

        let old = handle.replace_destination(new_sink).await;
        drop(old);

        client.write_all(b"two").await.unwrap();
        new_received.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"two");

        drop(client);
        tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn idle_timeout_is_a_clean_stop() {
        let (_client, source) = duplex(64);
        let (sink, _received) = duplex(64);

        let log = Arc::new(EventLog::default());
        let mut pipe = DuplexPipe::new(Direction::Download, source, sink);
        pipe.set_idle_timeout(Duration::from_millis(20));
        pipe.add_observer(log.clone());
        let mut handle = pipe.start();

        tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .unwrap();

        assert_eq!(log.snapshot(), vec!["start:download", "stop:download"]);
    }

    #[tokio::test]
    async fn abort_drops_a_blocked_reader() {
        let (_client, source) = duplex(64);
        let (sink, _received) = duplex(64);

        let pipe = DuplexPipe::new(Direction::Upload, source, sink);
        let mut handle = pipe.start();
        assert!(handle.is_running());

        handle.stop();
        handle.abort();
        tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .unwrap();
        assert!(!handle.is_running());
    }
}
