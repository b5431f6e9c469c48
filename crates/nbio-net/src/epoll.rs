//! Event loop
//!
//! A thin abstraction over edge-triggered readiness notification with
//! per-fd dispatch. One dedicated thread blocks in `epoll_wait` and
//! invokes the handler registered for each ready fd; dispatch is
//! therefore single-threaded per instance and all callbacks for fds on
//! the same loop are serialized.
//!
//! Registration always ORs `EPOLLET` into the interest mask. Handlers
//! own the edge-triggered discipline: drain the fd (read until EAGAIN,
//! write until EAGAIN or backlog empty) before returning, or wakeups
//! are lost.
//!
//! `remove` guarantees that no new callback for the fd starts after it
//! returns; a callback already running continues to completion.

use crate::error::{NetError, NetResult};
use crate::socket::errno;
use nbio_core::env::env_get;
use nbio_core::{nb_debug, nb_error};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Readable interest / readiness bit.
pub const EVENT_READ: u32 = libc::EPOLLIN as u32;

/// Writable interest / readiness bit.
pub const EVENT_WRITE: u32 = libc::EPOLLOUT as u32;

/// Error/hangup readiness bits. Delivered regardless of the registered
/// interest mask.
pub const EVENT_ERROR: u32 = (libc::EPOLLERR | libc::EPOLLHUP) as u32;

/// Per-fd readiness callback.
pub trait FdHandler: Send + Sync {
    fn on_fd_event(&self, fd: RawFd, events: u32);
}

struct EventLoopShared {
    epfd: RawFd,
    wake_fd: RawFd,
    handlers: Mutex<HashMap<RawFd, Arc<dyn FdHandler>>>,
    stop: AtomicBool,
    closed: AtomicBool,
}

/// Single-threaded edge-triggered readiness dispatcher. Clones share
/// the same loop.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<EventLoopShared>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EventLoop {
    /// Create the epoll instance and start the dispatch thread.
    ///
    /// `name` tags the thread and log lines. `NBIO_EPOLL_EVENTS`
    /// overrides the per-wait batch size (default 256).
    pub fn start(name: &str) -> NetResult<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(NetError::Io(errno()));
        }

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if wake_fd < 0 {
            let err = errno();
            unsafe { libc::close(epfd) };
            return Err(NetError::Io(err));
        }

        // The wakeup eventfd bypasses the handler table.
        let mut ev = libc::epoll_event {
            events: EVENT_READ,
            u64: wake_fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, wake_fd, &mut ev) };
        if rc != 0 {
            let err = errno();
            unsafe {
                libc::close(wake_fd);
                libc::close(epfd);
            }
            return Err(NetError::Io(err));
        }

        let shared = Arc::new(EventLoopShared {
            epfd,
            wake_fd,
            handlers: Mutex::new(HashMap::new()),
            stop: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let batch = env_get("NBIO_EPOLL_EVENTS", 256usize).max(1);
        let shared_clone = shared.clone();
        let handle = thread::Builder::new()
            .name(format!("nbio-epoll-{}", name))
            .spawn(move || dispatch_loop(shared_clone, batch))
            .map_err(|_| NetError::Io(libc::EAGAIN))?;

        Ok(Self {
            shared,
            thread: Arc::new(Mutex::new(Some(handle))),
        })
    }

    /// Register `fd` with the given interest mask (`EVENT_READ` and/or
    /// `EVENT_WRITE`); `EPOLLET` is always added. An fd may appear at
    /// most once.
    pub fn add(&self, fd: RawFd, interest: u32, handler: Arc<dyn FdHandler>) -> NetResult<()> {
        let mut handlers = self.shared.handlers.lock().unwrap();
        if handlers.contains_key(&fd) {
            return Err(NetError::AlreadyRegistered(fd));
        }

        let mut ev = libc::epoll_event {
            events: interest | libc::EPOLLET as u32,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.shared.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if rc != 0 {
            return Err(NetError::Io(errno()));
        }

        handlers.insert(fd, handler);
        nb_debug!("epoll: registered fd {} mask {:#x}", fd, interest);
        Ok(())
    }

    /// Unregister `fd`. After this returns, no new callback for the fd
    /// will start.
    pub fn remove(&self, fd: RawFd) -> NetResult<()> {
        let mut handlers = self.shared.handlers.lock().unwrap();
        if handlers.remove(&fd).is_none() {
            return Err(NetError::NotRegistered(fd));
        }

        let rc = unsafe {
            libc::epoll_ctl(
                self.shared.epfd,
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if rc != 0 {
            return Err(NetError::Io(errno()));
        }

        nb_debug!("epoll: removed fd {}", fd);
        Ok(())
    }

    /// Number of registered fds (momentary snapshot).
    pub fn registered(&self) -> usize {
        self.shared.handlers.lock().unwrap().len()
    }

    /// Stop the dispatch thread and close the fds.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);

        let one: u64 = 1;
        unsafe {
            libc::write(
                self.shared.wake_fd,
                &one as *const u64 as *const libc::c_void,
                8,
            );
        }

        if let Some(handle) = self.thread.lock().unwrap().take() {
            handle.join().expect("event loop thread panicked");
        }

        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            unsafe {
                libc::close(self.shared.wake_fd);
                libc::close(self.shared.epfd);
            }
        }
    }
}

fn dispatch_loop(shared: Arc<EventLoopShared>, batch: usize) {
    let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; batch];

    loop {
        let n = unsafe {
            libc::epoll_wait(shared.epfd, events.as_mut_ptr(), batch as libc::c_int, -1)
        };
        if n < 0 {
            if errno() == libc::EINTR {
                continue;
            }
            nb_error!("epoll_wait failed: errno {}", errno());
            break;
        }

        for ev in &events[..n as usize] {
            let fd = ev.u64 as RawFd;

            if fd == shared.wake_fd {
                let mut buf = 0u64;
                unsafe {
                    libc::read(shared.wake_fd, &mut buf as *mut u64 as *mut libc::c_void, 8);
                }
                continue;
            }

            // Clone the handler out so the table lock is not held
            // across the callback; a concurrent remove() for another fd
            // must not block on dispatch.
            let handler = shared.handlers.lock().unwrap().get(&fd).cloned();
            if let Some(h) = handler {
                h.on_fd_event(fd, ev.events);
            }
        }

        if shared.stop.load(Ordering::Acquire) {
            break;
        }
    }
}

impl Drop for EventLoopShared {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            unsafe {
                libc::close(self.wake_fd);
                libc::close(self.epfd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    struct PipeHandler {
        tx: Mutex<mpsc::Sender<(RawFd, u32)>>,
    }

    impl PipeHandler {
        fn new(tx: mpsc::Sender<(RawFd, u32)>) -> Self {
            Self { tx: Mutex::new(tx) }
        }
    }

    impl FdHandler for PipeHandler {
        fn on_fd_event(&self, fd: RawFd, events: u32) {
            // Drain to honor the edge-triggered contract.
            let mut buf = [0u8; 64];
            loop {
                let n = unsafe {
                    libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if n <= 0 {
                    break;
                }
            }
            let _ = self.tx.lock().unwrap().send((fd, events));
        }
    }

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_readiness_dispatch() {
        let eloop = EventLoop::start("test").unwrap();
        let (a, b) = socketpair();
        let (tx, rx) = mpsc::channel();

        eloop
            .add(a, EVENT_READ, Arc::new(PipeHandler::new(tx)))
            .unwrap();

        let msg = b"ping";
        unsafe { libc::write(b, msg.as_ptr() as *const libc::c_void, msg.len()) };

        let (fd, events) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(fd, a);
        assert!(events & EVENT_READ != 0);

        eloop.remove(a).unwrap();
        eloop.shutdown();
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let eloop = EventLoop::start("dup").unwrap();
        let (a, b) = socketpair();
        let (tx, rx) = mpsc::channel();
        drop(rx);

        eloop
            .add(a, EVENT_READ, Arc::new(PipeHandler::new(tx.clone())))
            .unwrap();
        assert_eq!(
            eloop
                .add(a, EVENT_READ, Arc::new(PipeHandler::new(tx)))
                .err(),
            Some(NetError::AlreadyRegistered(a))
        );

        eloop.remove(a).unwrap();
        eloop.shutdown();
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_remove_unknown_fd() {
        let eloop = EventLoop::start("rm").unwrap();
        assert_eq!(eloop.remove(12345).err(), Some(NetError::NotRegistered(12345)));
        eloop.shutdown();
    }

    #[test]
    fn test_no_dispatch_after_remove() {
        let eloop = EventLoop::start("after-rm").unwrap();
        let (a, b) = socketpair();
        let (tx, rx) = mpsc::channel();

        eloop
            .add(a, EVENT_READ, Arc::new(PipeHandler::new(tx)))
            .unwrap();
        eloop.remove(a).unwrap();

        let msg = b"late";
        unsafe { libc::write(b, msg.as_ptr() as *const libc::c_void, msg.len()) };

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        eloop.shutdown();
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }
}
