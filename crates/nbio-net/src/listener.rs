//! TCP listener
//!
//! Accepts inbound connections and hands each one to the registered
//! accept callback as a fresh `TcpChannel`, posted through the pool.
//!
//! One connection is accepted per readable edge; a burst of connects is
//! drained across subsequent edges. bind/listen failures are fatal
//! (this is a long-lived service daemon); transient accept failures are
//! reported to the callback with a negative status.

use crate::channel::TcpChannel;
use crate::epoll::{EventLoop, FdHandler, EVENT_READ};
use crate::socket::{self, errno};
use nbio_core::{nb_debug, nb_info, nb_warn};
use nbio_runtime::ThreadPool;
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

/// Listen backlog passed to `listen(2)`.
const ACCEPT_BACKLOG: libc::c_int = 4096;

/// Accept callback: `(status, channel)`. Status 0 with a channel on
/// success, negative errno with `None` on a transient accept failure.
pub type AcceptFn = Arc<dyn Fn(i32, Option<TcpChannel>) + Send + Sync>;

struct ListenerState {
    fd: RawFd,
    accept_cb: Option<AcceptFn>,
}

struct ListenerShared {
    pool: ThreadPool,
    eloop: EventLoop,
    state: Mutex<ListenerState>,
}

/// Inbound connection acceptor. Clones share the same listener.
#[derive(Clone)]
pub struct TcpListener {
    shared: Arc<ListenerShared>,
}

impl TcpListener {
    pub fn new(pool: ThreadPool, eloop: EventLoop) -> Self {
        Self {
            shared: Arc::new(ListenerShared {
                pool,
                eloop,
                state: Mutex::new(ListenerState {
                    fd: -1,
                    accept_cb: None,
                }),
            }),
        }
    }

    /// Bind `addr`, listen, and register for readable edges. One
    /// accept callback may be registered at a time.
    ///
    /// Panics on bind/listen failure.
    pub fn listen(&self, addr: SocketAddrV4, cb: AcceptFn) {
        let fd = socket::nonblocking_stream_socket().expect("listener: socket failed");
        socket::set_reuse_addr(fd, true).expect("listener: SO_REUSEADDR failed");
        socket::bind_fd(fd, addr).expect("listener: bind failed");

        let rc = unsafe { libc::listen(fd, ACCEPT_BACKLOG) };
        assert_eq!(rc, 0, "listener: listen failed: errno {}", errno());

        {
            let mut st = self.shared.state.lock().unwrap();
            assert!(
                st.accept_cb.is_none(),
                "listener already has an accept client"
            );
            st.fd = fd;
            st.accept_cb = Some(cb);
        }

        self.shared
            .eloop
            .add(fd, EVENT_READ, Arc::new(self.clone()))
            .expect("listener: event loop registration failed");

        nb_info!(
            "listener started on {}",
            socket::local_addr_of(fd).expect("listener: getsockname failed")
        );
    }

    /// The bound address (useful after binding port 0).
    pub fn local_addr(&self) -> SocketAddrV4 {
        let fd = self.shared.state.lock().unwrap().fd;
        assert!(fd >= 0, "listener not listening");
        socket::local_addr_of(fd).expect("listener: getsockname failed")
    }

    /// Stop accepting: remove the fd from the loop, clear the client,
    /// shut down and close the socket.
    pub fn shutdown(&self) {
        let fd = {
            let mut st = self.shared.state.lock().unwrap();
            st.accept_cb = None;
            let fd = st.fd;
            st.fd = -1;
            fd
        };
        if fd < 0 {
            return;
        }

        self.shared
            .eloop
            .remove(fd)
            .expect("listener: event loop removal failed");

        unsafe {
            libc::shutdown(fd, libc::SHUT_RDWR);
            libc::close(fd);
        }
        nb_info!("listener shut down");
    }
}

impl FdHandler for TcpListener {
    fn on_fd_event(&self, _fd: RawFd, _events: u32) {
        let (fd, cb) = {
            let st = self.shared.state.lock().unwrap();
            (st.fd, st.accept_cb.clone())
        };
        let cb = match cb {
            Some(cb) => cb,
            None => return, // raced with shutdown
        };

        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let client_fd = unsafe {
            libc::accept4(
                fd,
                &mut addr as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };

        if client_fd < 0 {
            let err = errno();
            if err == libc::EAGAIN {
                return;
            }
            nb_warn!("listener: accept failed: errno {}", err);
            self.shared.pool.schedule(move || cb(-err, None));
            return;
        }

        let _ = socket::set_nodelay(client_fd, true);

        let ch = TcpChannel::new(
            client_fd,
            self.shared.pool.clone(),
            self.shared.eloop.clone(),
        );
        nb_debug!("listener: accepted fd {}", client_fd);
        self.shared.pool.schedule(move || cb(0, Some(ch)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbio_runtime::RuntimeConfig;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_accept_produces_channel() {
        let pool = ThreadPool::new();
        pool.start(RuntimeConfig::new().num_workers(1));
        let eloop = EventLoop::start("lst").unwrap();

        let listener = TcpListener::new(pool.clone(), eloop.clone());
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        listener.listen(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(move |status, ch| {
                tx.lock().unwrap().send((status, ch)).unwrap();
            }),
        );

        let addr = listener.local_addr();
        assert_ne!(addr.port(), 0);

        // Plain blocking client from a helper thread.
        let t = std::thread::spawn(move || std::net::TcpStream::connect(addr).unwrap());

        let (status, ch) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(status, 0);
        let ch = ch.expect("accept returned no channel");
        assert!(ch.fd() >= 0);

        drop(t.join().unwrap());
        ch.close();
        listener.shutdown();

        let (btx, brx) = mpsc::channel();
        pool.schedule_barrier(move || btx.send(()).unwrap());
        brx.recv_timeout(Duration::from_secs(5)).unwrap();

        eloop.shutdown();
        pool.shutdown();
    }

    #[test]
    fn test_accepts_several_connections() {
        let pool = ThreadPool::new();
        pool.start(RuntimeConfig::new().num_workers(1));
        let eloop = EventLoop::start("lst2").unwrap();

        let listener = TcpListener::new(pool.clone(), eloop.clone());
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        listener.listen(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(move |status, ch| {
                assert_eq!(status, 0);
                tx.lock().unwrap().send(ch.unwrap()).unwrap();
            }),
        );

        // One accept per readable edge, so connect one at a time: each
        // new connection raises a fresh edge for the next accept.
        let addr = listener.local_addr();
        let mut streams = Vec::new();
        let mut channels = Vec::new();
        for _ in 0..4 {
            streams.push(std::net::TcpStream::connect(addr).unwrap());
            channels.push(rx.recv_timeout(Duration::from_secs(10)).unwrap());
        }

        for ch in &channels {
            ch.close();
        }
        drop(streams);
        listener.shutdown();

        let (btx, brx) = mpsc::channel();
        pool.schedule_barrier(move || btx.send(()).unwrap());
        brx.recv_timeout(Duration::from_secs(5)).unwrap();

        eloop.shutdown();
        pool.shutdown();
    }
}
