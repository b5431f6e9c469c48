//! # nbio - non-blocking asynchronous runtime
//!
//! Three tightly coupled subsystems:
//!
//! - a **worker pool** that routes one-shot routines to pinned
//!   cooperative worker threads (round-robin, no stealing),
//! - a **timer service** delivering delayed routines onto that pool
//!   from a CLOCK_MONOTONIC timerfd,
//! - an **epoll TCP transport** (listener, connector, bidirectional
//!   channel) whose readiness events become routines posted back onto
//!   the pool.
//!
//! ## Quick start
//!
//! ```ignore
//! use nbio::{EventLoop, RuntimeConfig, SocketAddress, TcpConnector, ThreadPool};
//!
//! let pool = ThreadPool::new();
//! pool.start(RuntimeConfig::from_env());
//!
//! let eloop = EventLoop::start("main").unwrap();
//! let connector = TcpConnector::new(pool.clone(), eloop.clone());
//! connector.connect(
//!     SocketAddress::to("127.0.0.1:9000".parse().unwrap()),
//!     Box::new(|status, ch| {
//!         // runs on a pool worker
//!     }),
//! );
//!
//! pool.wait();
//! eloop.shutdown();
//! pool.shutdown();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        User code                            │
//! │        schedule(), schedule_in(), read(), enqueue_write()   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Worker   │ ...  │  Worker   │      │   Timer   │
//!    │  thread   │      │  thread   │      │  (timerfd)│
//!    └───────────┘      └───────────┘      └───────────┘
//!          ▲                   ▲                   │
//!          │   completions posted as routines      │
//!          └───────────────────┼───────────────────┘
//!                              │
//!                    ┌─────────────────┐
//!                    │   Event loop    │
//!                    │ (epoll, ET, one │
//!                    │  thread per     │
//!                    │  instance)      │
//!                    └─────────────────┘
//!                              │
//!                  listener / connector / channel fds
//! ```
//!
//! Workers run one routine to completion before the next; routines must
//! not block. The only blocking points are an idle worker's queue wait,
//! the timer thread's timerfd read, and the event loop's `epoll_wait`.

// Core primitives
pub use nbio_core::{IoBuffer, PerfCounter, Routine, Stopwatch, WorkQueue};

// Log macros and their plumbing
pub use nbio_core::kprint::{
    init as init_logging, set_flush_enabled, set_log_level, LogLevel,
};
pub use nbio_core::{nb_debug, nb_error, nb_info, nb_trace, nb_warn};

// Env helpers
pub use nbio_core::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

// Runtime
pub use nbio_runtime::{num_cores, ConfigError, RuntimeConfig, ThreadPool, TimerService};

// Transport
pub use nbio_net::{
    AcceptFn, ChannelClient, ConnectFn, EventLoop, FdHandler, NetError, NetResult, ReadDoneFn,
    RetireDoneFn, SocketAddress, TcpChannel, TcpConnector, TcpListener, DEFAULT_WRITE_BACKLOG,
    EVENT_ERROR, EVENT_READ, EVENT_WRITE,
};

// Wire helpers
pub use nbio_wire::{adler32, Adler32, PacketHeader, Wire, WireError, WireReader, WireWriter};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc, Mutex, Weak};
    use std::time::Duration;

    const ITERATIONS: usize = 20;
    const BLOCK: usize = 4096;

    /// Client writes 20 random 4 KiB blocks; the server reads them back
    /// block by block and checks each Adler-32 against a FIFO of the
    /// checksums pushed at send time.
    struct EchoHarness {
        sent: AtomicUsize,
        verified: AtomicUsize,
        cksums: Mutex<VecDeque<u32>>,
        done: Mutex<mpsc::Sender<()>>,
        me: Weak<EchoHarness>,
    }

    impl EchoHarness {
        fn new(done: mpsc::Sender<()>) -> Arc<Self> {
            Arc::new_cyclic(|weak| Self {
                sent: AtomicUsize::new(0),
                verified: AtomicUsize::new(0),
                cksums: Mutex::new(VecDeque::new()),
                done: Mutex::new(done),
                me: weak.clone(),
            })
        }

        /// Write blocks until the socket pushes back or the quota is
        /// reached; a partial write resumes from `write_done`.
        fn send_data(&self, ch: &TcpChannel) {
            loop {
                if self.sent.load(Ordering::SeqCst) >= ITERATIONS {
                    return;
                }
                self.sent.fetch_add(1, Ordering::SeqCst);

                let mut buf = IoBuffer::alloc(BLOCK);
                buf.fill_random();
                self.cksums
                    .lock()
                    .unwrap()
                    .push_back(adler32(buf.as_slice()));

                match ch.enqueue_write(buf) {
                    Ok(n) if n == BLOCK => continue,
                    Ok(_) => return,
                    Err(e) => panic!("write failed: {}", e),
                }
            }
        }

        fn read_loop(self: Arc<Self>, ch: TcpChannel) {
            loop {
                let me = self.clone();
                let res = ch.read(
                    IoBuffer::alloc(BLOCK),
                    Box::new(move |ch, status, buf| {
                        assert_eq!(status as usize, BLOCK);
                        me.verify(&buf);
                        me.clone().read_loop(ch);
                    }),
                );

                match res {
                    Some((n, buf)) => {
                        assert_eq!(n, BLOCK);
                        self.verify(&buf);
                    }
                    None => return,
                }
            }
        }

        fn verify(&self, buf: &IoBuffer) {
            let expect = self
                .cksums
                .lock()
                .unwrap()
                .pop_front()
                .expect("block arrived with no checksum queued");
            assert_eq!(adler32(buf.as_slice()), expect, "block corrupted in transit");

            if self.verified.fetch_add(1, Ordering::SeqCst) + 1 == ITERATIONS {
                self.done.lock().unwrap().send(()).unwrap();
            }
        }
    }

    impl ChannelClient for EchoHarness {
        fn write_done(&self, ch: TcpChannel, status: isize) {
            assert!(status > 0, "write error: {}", status);
            if let Some(me) = self.me.upgrade() {
                me.send_data(&ch);
            }
        }
    }

    fn retire(ch: &TcpChannel, client: &Arc<dyn ChannelClient>) {
        let (tx, rx) = mpsc::channel();
        ch.unregister_client(
            client,
            Box::new(move |status| {
                tx.send(status).unwrap();
            }),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
        ch.close();
    }

    #[test]
    fn test_local_echo_twenty_iterations() {
        let pool = ThreadPool::new();
        pool.start(RuntimeConfig::new().num_workers(num_cores().min(4).max(1)));
        let eloop = EventLoop::start("echo-test").unwrap();

        let listener = TcpListener::new(pool.clone(), eloop.clone());
        let (atx, arx) = mpsc::channel();
        let atx = Mutex::new(atx);
        listener.listen(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(move |status, ch| {
                assert_eq!(status, 0);
                atx.lock().unwrap().send(ch.unwrap()).unwrap();
            }),
        );

        let connector = TcpConnector::new(pool.clone(), eloop.clone());
        let (ctx, crx) = mpsc::channel();
        connector.connect(
            SocketAddress::to(listener.local_addr()),
            Box::new(move |status, ch| {
                assert_eq!(status, 0);
                ctx.send(ch.unwrap()).unwrap();
            }),
        );

        let server_ch = arx.recv_timeout(Duration::from_secs(5)).unwrap();
        let client_ch = crx.recv_timeout(Duration::from_secs(5)).unwrap();
        listener.shutdown();

        let (done_tx, done_rx) = mpsc::channel();
        let harness = EchoHarness::new(done_tx);
        let handle: Arc<dyn ChannelClient> = harness.clone();

        server_ch.register_client(handle.clone());
        client_ch.register_client(handle.clone());

        harness.clone().read_loop(server_ch.clone());
        harness.send_data(&client_ch);

        done_rx
            .recv_timeout(Duration::from_secs(30))
            .expect("echo did not complete");

        assert_eq!(harness.verified.load(Ordering::SeqCst), ITERATIONS);
        assert!(harness.cksums.lock().unwrap().is_empty());

        retire(&server_ch, &handle);
        retire(&client_ch, &handle);

        let (btx, brx) = mpsc::channel();
        pool.schedule_barrier(move || btx.send(()).unwrap());
        brx.recv_timeout(Duration::from_secs(10)).unwrap();

        eloop.shutdown();
        pool.shutdown();
    }
}
