//! Proxy front end and connection handling.

pub mod handler;
pub mod session;
pub mod socks5;

pub use handler::handle_connect;
pub use session::{Endpoint, Reply, Session};
pub use socks5::Socks5Proxy;
