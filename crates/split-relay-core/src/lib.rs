//! # Split-Relay Core
//!
//! Core library for the split-relay proxy service.
//! Provides a SOCKS5 CONNECT relay that detects connection resets
//! injected right after the client's first request segment and retries
//! them with the first flight split across two TCP writes.

pub mod config;
pub mod connect;
pub mod error;
pub mod metrics;
pub mod pipe;
pub mod proxy;
pub mod relay;
pub mod stats;

pub use config::{Config, LoggingConfig, RelayConfig, ServerConfig};
pub use connect::{Connector, Outbound, TcpConnector};
pub use error::{Error, Result};
pub use metrics::{LogSink, MetricsSink};
pub use pipe::{Direction, DuplexPipe, PipeHandle, TransferObserver};
pub use proxy::{Endpoint, Reply, Session, Socks5Proxy};
pub use stats::ConnectionStats;
