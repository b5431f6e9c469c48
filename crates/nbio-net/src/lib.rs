//! # nbio-net
//!
//! Epoll-based TCP transport: listener, outbound connector and the
//! bidirectional channel. I/O readiness is demultiplexed by a
//! single-threaded edge-triggered event loop; every completion (read
//! done, write done, accept, connect, retire) is posted back onto the
//! worker pool, so user callbacks never run under a transport lock.
//!
//! ## Modules
//!
//! - `epoll` - EventLoop: per-fd dispatch of edge-triggered readiness
//! - `channel` - TcpChannel: read context, write backlog, writev drain
//! - `listener` - TcpListener: inbound connections
//! - `connector` - TcpConnector: outbound connections
//! - `socket` - sockaddr plumbing and socket options
//! - `error` - NetError / NetResult

pub mod error;
pub mod socket;
pub mod epoll;
pub mod channel;
pub mod listener;
pub mod connector;

pub use channel::{ChannelClient, ReadDoneFn, RetireDoneFn, TcpChannel, DEFAULT_WRITE_BACKLOG};
pub use connector::{ConnectFn, TcpConnector};
pub use epoll::{EventLoop, FdHandler, EVENT_ERROR, EVENT_READ, EVENT_WRITE};
pub use error::{NetError, NetResult};
pub use listener::{AcceptFn, TcpListener};
pub use socket::SocketAddress;
