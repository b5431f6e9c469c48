//! TCP connector
//!
//! Initiates outbound connections. `connect` issues a non-blocking
//! `connect(2)` (expected to return EINPROGRESS), registers the fd for
//! writable edges and parks the completion callback in an in-flight
//! map. The readiness callback removes the fd from the loop, resolves
//! the entry one way and posts the completion through the pool; the
//! entry leaves the map as soon as the result is known.

use crate::channel::TcpChannel;
use crate::epoll::{EventLoop, FdHandler, EVENT_ERROR, EVENT_WRITE};
use crate::socket::{self, errno, SocketAddress};
use nbio_core::{nb_debug, nb_warn};
use nbio_runtime::ThreadPool;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

/// Send/receive window for outbound sockets.
const CONNECT_WINDOW_BYTES: usize = 640 * 1024;

/// Connect completion: `(status, channel)`. Status 0 with a channel on
/// success, negative errno with `None` on failure.
pub type ConnectFn = Box<dyn FnOnce(i32, Option<TcpChannel>) + Send>;

struct ConnectorShared {
    pool: ThreadPool,
    eloop: EventLoop,
    pending: Mutex<HashMap<RawFd, ConnectFn>>,
}

/// Outbound connection initiator. Clones share the same connector.
#[derive(Clone)]
pub struct TcpConnector {
    shared: Arc<ConnectorShared>,
}

impl TcpConnector {
    pub fn new(pool: ThreadPool, eloop: EventLoop) -> Self {
        Self {
            shared: Arc::new(ConnectorShared {
                pool,
                eloop,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start connecting to `addr.remote()` from `addr.local()`.
    ///
    /// Socket/bind failures are fatal. The result (refused, timed out
    /// or connected) arrives through `cb`.
    pub fn connect(&self, addr: SocketAddress, cb: ConnectFn) {
        let fd = socket::nonblocking_stream_socket().expect("connector: socket failed");
        socket::set_reuse_addr(fd, true).expect("connector: SO_REUSEADDR failed");
        socket::set_window(fd, CONNECT_WINDOW_BYTES).expect("connector: window sizing failed");
        socket::bind_fd(fd, addr.local()).expect("connector: local bind failed");

        let raw = socket::sockaddr_in(addr.remote());
        let rc = unsafe {
            libc::connect(
                fd,
                &raw as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            let err = errno();
            assert_eq!(
                err,
                libc::EINPROGRESS,
                "connector: connect failed synchronously: errno {}",
                err
            );
        }
        // rc == 0 (possible on loopback) is handled like EINPROGRESS:
        // the writable edge fires immediately.

        self.shared.pending.lock().unwrap().insert(fd, cb);

        self.shared
            .eloop
            .add(fd, EVENT_WRITE, Arc::new(self.clone()))
            .expect("connector: event loop registration failed");

        nb_debug!("connector: fd {} -> {}", fd, addr.remote());
    }

    /// In-flight connection count (momentary snapshot).
    pub fn pending(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }

    /// Abort every in-flight connection: each callback fires with a
    /// negative status and its fd is closed.
    pub fn shutdown(&self) {
        let drained: Vec<(RawFd, ConnectFn)> = {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.drain().collect()
        };

        for (fd, cb) in drained {
            let _ = self.shared.eloop.remove(fd);
            unsafe { libc::close(fd) };
            self.shared
                .pool
                .schedule(move || cb(-libc::ECANCELED, None));
        }
    }
}

impl FdHandler for TcpConnector {
    fn on_fd_event(&self, fd: RawFd, events: u32) {
        let _ = self.shared.eloop.remove(fd);

        let cb = self.shared.pending.lock().unwrap().remove(&fd);
        let cb = match cb {
            Some(cb) => cb,
            None => return, // raced with shutdown
        };

        if events & EVENT_ERROR != 0 {
            let err = socket::take_socket_error(fd)
                .ok()
                .filter(|&e| e != 0)
                .unwrap_or(libc::ECONNREFUSED);
            unsafe { libc::close(fd) };
            nb_warn!("connector: fd {} failed: errno {}", fd, err);
            self.shared.pool.schedule(move || cb(-err, None));
            return;
        }

        let ch = TcpChannel::new(fd, self.shared.pool.clone(), self.shared.eloop.clone());
        nb_debug!("connector: fd {} connected", fd);
        self.shared.pool.schedule(move || cb(0, Some(ch)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbio_runtime::RuntimeConfig;
    use std::sync::mpsc;
    use std::time::Duration;

    fn rig() -> (ThreadPool, EventLoop) {
        let pool = ThreadPool::new();
        pool.start(RuntimeConfig::new().num_workers(1));
        let eloop = EventLoop::start("conn").unwrap();
        (pool, eloop)
    }

    fn quiesce(pool: &ThreadPool) {
        let (tx, rx) = mpsc::channel();
        pool.schedule_barrier(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_refused_connection_reports_error() {
        let (pool, eloop) = rig();
        let connector = TcpConnector::new(pool.clone(), eloop.clone());

        // Nothing listens on a reserved low port on loopback.
        let (tx, rx) = mpsc::channel();
        connector.connect(
            SocketAddress::to("127.0.0.1:1".parse().unwrap()),
            Box::new(move |status, ch| {
                tx.send((status, ch.is_some())).unwrap();
            }),
        );

        let (status, has_channel) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(status < 0, "expected a failure status, got {}", status);
        assert!(!has_channel);
        assert_eq!(connector.pending(), 0);

        quiesce(&pool);
        eloop.shutdown();
        pool.shutdown();
    }

    #[test]
    fn test_successful_connect_produces_channel() {
        let (pool, eloop) = rig();

        // A plain std listener on a kernel-chosen port.
        let accept = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = match accept.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };

        let connector = TcpConnector::new(pool.clone(), eloop.clone());
        let (tx, rx) = mpsc::channel();
        connector.connect(
            SocketAddress::to(addr),
            Box::new(move |status, ch| {
                tx.send((status, ch)).unwrap();
            }),
        );

        let (peer, _) = accept.accept().unwrap();

        let (status, ch) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(status, 0);
        let ch = ch.expect("no channel on success");
        assert!(ch.fd() >= 0);
        assert_eq!(connector.pending(), 0);

        ch.close();
        drop(peer);
        quiesce(&pool);
        eloop.shutdown();
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_delivers_exactly_one_callback() {
        let (pool, eloop) = rig();
        let connector = TcpConnector::new(pool.clone(), eloop.clone());

        // Refused port; shutdown races the error edge. Whichever side
        // takes the in-flight entry fires the callback exactly once,
        // with a negative status either way.
        let (tx, rx) = mpsc::channel();
        connector.connect(
            SocketAddress::to("127.0.0.1:1".parse().unwrap()),
            Box::new(move |status, ch| {
                tx.send((status, ch.is_some())).unwrap();
            }),
        );

        connector.shutdown();

        let (status, has_channel) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(status < 0);
        assert!(!has_channel);
        assert_eq!(connector.pending(), 0);
        assert!(
            rx.recv_timeout(Duration::from_millis(300)).is_err(),
            "completion delivered twice"
        );

        quiesce(&pool);
        eloop.shutdown();
        pool.shutdown();
    }
}
