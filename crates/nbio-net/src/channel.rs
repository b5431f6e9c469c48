//! TCP channel
//!
//! A bidirectional byte stream over one connected socket fd, registered
//! on one event loop. Per-channel state (client handle, write backlog,
//! in-flight read context) lives behind a channel-local mutex; the
//! fd-readiness callback and every public operation take that lock.
//!
//! Completion handlers are never invoked under the lock: read
//! completions, `write_done` notifications and the retire callback are
//! all posted through the worker pool.
//!
//! ## Read state machine
//!
//! Idle (no context) or Pending (buf, 0 <= filled < len). `read` parks
//! a context and drains synchronously; a synchronous completion is
//! returned inline to the caller and the handler is dropped unused.
//! Readable edges keep filling the pending buffer; when it fills from
//! an edge the handler is posted with `(channel, n, buf)`. A `read(2)`
//! of 0 short of the target leaves the context pending (peer EOF is
//! surfaced by a later error or by the application protocol). A
//! non-EAGAIN errno posts the handler with `(-errno, empty)` and
//! resets to Idle.
//!
//! ## Write state machine
//!
//! The backlog is a FIFO of whole buffers, bounded by the configured
//! limit. Each drain gathers up to IOV_MAX front buffers into one
//! `writev`; fully-written buffers are popped (posting one
//! `write_done(channel, cumulative)` each on async drains), a partial
//! head keeps its tail via `cut_front`. Synchronous drains (from
//! `enqueue_write` on an empty backlog) report bytes to the caller and
//! post nothing.

use crate::epoll::{EventLoop, FdHandler, EVENT_ERROR, EVENT_READ, EVENT_WRITE};
use crate::error::{NetError, NetResult};
use crate::socket::errno;
use nbio_core::env::env_get;
use nbio_core::{nb_debug, nb_error, IoBuffer};
use nbio_runtime::ThreadPool;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Default write backlog limit, in buffers.
pub const DEFAULT_WRITE_BACKLOG: usize = 1024;

/// Linux IOV_MAX: the most buffers one writev can gather.
const MAX_WRITEV_IOVECS: usize = 1024;

/// Read completion: `(channel, bytes_or_negative_errno, buffer)`.
pub type ReadDoneFn = Box<dyn FnOnce(TcpChannel, isize, IoBuffer) + Send>;

/// Retire completion for `unregister_client`.
pub type RetireDoneFn = Box<dyn FnOnce(i32) + Send>;

/// The owner of a channel. Receives write completions.
pub trait ChannelClient: Send + Sync {
    /// One asynchronously drained buffer finished writing. `status` is
    /// the cumulative byte count for the drain that popped it, or a
    /// negative errno on write failure.
    fn write_done(&self, ch: TcpChannel, status: isize);
}

struct ReadCtx {
    buf: IoBuffer,
    filled: usize,
    handler: Option<ReadDoneFn>,
}

#[derive(Default)]
struct ChannelState {
    client: Option<Arc<dyn ChannelClient>>,
    wbacklog: VecDeque<IoBuffer>,
    rctx: Option<ReadCtx>,
    retire: Option<RetireDoneFn>,
}

struct ChannelShared {
    fd: RawFd,
    pool: ThreadPool,
    eloop: EventLoop,
    backlog_limit: usize,
    closed: AtomicBool,
    state: Mutex<ChannelState>,
}

/// Bidirectional byte stream over a connected socket. Clones share the
/// same channel.
#[derive(Clone)]
pub struct TcpChannel {
    shared: Arc<ChannelShared>,
}

enum ReadOutcome {
    /// No read context.
    Idle,
    /// Context parked waiting for more bytes.
    Pending,
    /// Buffer filled; the caller decides whether to post the handler
    /// (async) or drop it and return inline (sync).
    Complete(usize, IoBuffer, ReadDoneFn),
}

impl TcpChannel {
    /// Wrap a connected non-blocking socket. The backlog limit comes
    /// from `NBIO_WRITE_BACKLOG` (default 1024).
    pub fn new(fd: RawFd, pool: ThreadPool, eloop: EventLoop) -> Self {
        Self::with_backlog(fd, pool, eloop, env_get("NBIO_WRITE_BACKLOG", DEFAULT_WRITE_BACKLOG))
    }

    /// Wrap a connected non-blocking socket with an explicit backlog
    /// limit.
    pub fn with_backlog(fd: RawFd, pool: ThreadPool, eloop: EventLoop, backlog: usize) -> Self {
        assert!(fd >= 0);
        assert!(backlog > 0);
        Self {
            shared: Arc::new(ChannelShared {
                fd,
                pool,
                eloop,
                backlog_limit: backlog,
                closed: AtomicBool::new(false),
                state: Mutex::new(ChannelState::default()),
            }),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.shared.fd
    }

    /// Attach the client and register the fd for read and write edges.
    ///
    /// Precondition: no client attached.
    pub fn register_client(&self, client: Arc<dyn ChannelClient>) {
        {
            let mut st = self.shared.state.lock().unwrap();
            assert!(
                st.client.is_none(),
                "channel fd {} already has a client",
                self.shared.fd
            );
            st.client = Some(client);
        }

        self.shared
            .eloop
            .add(
                self.shared.fd,
                EVENT_READ | EVENT_WRITE,
                Arc::new(self.clone()),
            )
            .expect("failed to register channel fd with the event loop");
    }

    /// Detach the client: remove the fd from the event loop, fence on a
    /// pool-wide barrier, then clear all channel state and run
    /// `done(0)`. This is the only safe retire path.
    pub fn unregister_client(&self, client: &Arc<dyn ChannelClient>, done: RetireDoneFn) {
        {
            let mut st = self.shared.state.lock().unwrap();
            let attached = st
                .client
                .as_ref()
                .expect("unregister_client without a client attached");
            // Compare data pointers, not fat pointers: vtables may be
            // duplicated across codegen units.
            assert!(
                Arc::as_ptr(attached) as *const u8 == Arc::as_ptr(client) as *const u8,
                "unregister_client by a client that is not attached"
            );
            st.retire = Some(done);
        }

        self.shared
            .eloop
            .remove(self.shared.fd)
            .expect("failed to remove channel fd from the event loop");

        let ch = self.clone();
        self.shared.pool.schedule_barrier(move || ch.retire_done());
    }

    fn retire_done(&self) {
        let done = {
            let mut st = self.shared.state.lock().unwrap();
            st.wbacklog.clear();
            st.rctx = None;
            st.client = None;
            st.retire.take().expect("retire completion missing")
        };
        done(0);
    }

    /// Start filling `buf`. Exactly one read may be outstanding; a
    /// second one is a precondition violation.
    ///
    /// Returns `Some((n, buf))` when the read completed synchronously
    /// (the handler is not invoked; the caller already knows).
    /// Returns `None` when the read parked (the handler fires from a
    /// readable edge) or failed (the handler fires with a negative
    /// status and an empty buffer).
    pub fn read(&self, buf: IoBuffer, handler: ReadDoneFn) -> Option<(usize, IoBuffer)> {
        assert!(!buf.is_empty(), "read into an empty buffer");

        let mut st = self.shared.state.lock().unwrap();
        assert!(
            st.rctx.is_none(),
            "channel fd {}: a read is already in flight",
            self.shared.fd
        );
        st.rctx = Some(ReadCtx {
            buf,
            filled: 0,
            handler: Some(handler),
        });

        match self.drain_read(&mut st) {
            ReadOutcome::Complete(n, buf, _handler) => Some((n, buf)),
            ReadOutcome::Idle | ReadOutcome::Pending => None,
        }
    }

    /// Append `buf` to the write backlog.
    ///
    /// Fails with `Busy` when the backlog is at its limit (no side
    /// effect). When the backlog was empty the write is drained
    /// synchronously first and the byte count written now is returned;
    /// otherwise the writable edge picks it up and completion arrives
    /// through `ChannelClient::write_done`.
    pub fn enqueue_write(&self, buf: IoBuffer) -> NetResult<usize> {
        let mut st = self.shared.state.lock().unwrap();

        if st.wbacklog.len() >= self.shared.backlog_limit {
            return Err(NetError::Busy);
        }

        let was_empty = st.wbacklog.is_empty();
        st.wbacklog.push_back(buf);

        if was_empty {
            return self.drain_write(&mut st, false).map_err(NetError::Io);
        }
        Ok(0)
    }

    /// Queued-but-unwritten buffer count (momentary snapshot).
    pub fn backlog_len(&self) -> usize {
        self.shared.state.lock().unwrap().wbacklog.len()
    }

    /// OS-level shutdown and close. Precondition: no client attached
    /// (retire through `unregister_client` first).
    pub fn close(&self) {
        {
            let st = self.shared.state.lock().unwrap();
            assert!(
                st.client.is_none(),
                "channel fd {} closed with a client attached",
                self.shared.fd
            );
        }

        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            nb_debug!("closing channel fd {}", self.shared.fd);
            unsafe {
                libc::shutdown(self.shared.fd, libc::SHUT_RDWR);
                libc::close(self.shared.fd);
            }
        }
    }

    /// Drain the socket into the pending read context.
    fn drain_read(&self, st: &mut ChannelState) -> ReadOutcome {
        let fd = self.shared.fd;

        loop {
            let rctx = match st.rctx.as_mut() {
                Some(rctx) => rctx,
                None => return ReadOutcome::Idle,
            };

            let dst = &mut rctx.buf.as_mut_slice()[rctx.filled..];
            let n = unsafe { libc::read(fd, dst.as_mut_ptr() as *mut libc::c_void, dst.len()) };

            if n < 0 {
                let err = errno();
                if err == libc::EAGAIN {
                    return ReadOutcome::Pending;
                }

                nb_error!("channel fd {}: read failed: errno {}", fd, err);
                let mut ctx = st.rctx.take().unwrap();
                let handler = ctx.handler.take().unwrap();
                let ch = self.clone();
                self.shared
                    .pool
                    .schedule(move || handler(ch, -(err as isize), IoBuffer::alloc(0)));
                return ReadOutcome::Idle;
            }

            if n == 0 {
                // Peer EOF short of the target; context stays pending.
                return ReadOutcome::Pending;
            }

            rctx.filled += n as usize;
            debug_assert!(rctx.filled <= rctx.buf.len());

            if rctx.filled == rctx.buf.len() {
                let mut ctx = st.rctx.take().unwrap();
                let handler = ctx.handler.take().unwrap();
                return ReadOutcome::Complete(ctx.filled, ctx.buf, handler);
            }
        }
    }

    /// Drain the write backlog to the socket. Returns bytes written in
    /// this drain, or the errno of a fatal write error.
    ///
    /// Async drains (`is_async`) post `write_done` per popped buffer
    /// and on error; synchronous drains leave reporting to the caller.
    fn drain_write(&self, st: &mut ChannelState, is_async: bool) -> Result<usize, i32> {
        let fd = self.shared.fd;
        let mut total: usize = 0;

        loop {
            if st.wbacklog.is_empty() {
                break;
            }

            let iovcnt = st.wbacklog.len().min(MAX_WRITEV_IOVECS);
            let mut iovecs: Vec<libc::iovec> = Vec::with_capacity(iovcnt);
            for buf in st.wbacklog.iter().take(iovcnt) {
                iovecs.push(libc::iovec {
                    iov_base: buf.as_slice().as_ptr() as *mut libc::c_void,
                    iov_len: buf.len(),
                });
            }

            let n = unsafe { libc::writev(fd, iovecs.as_ptr(), iovcnt as libc::c_int) };

            if n < 0 {
                let err = errno();
                if err == libc::EAGAIN {
                    break;
                }

                nb_error!("channel fd {}: write failed: errno {}", fd, err);
                if is_async {
                    if let Some(client) = st.client.clone() {
                        let ch = self.clone();
                        self.shared
                            .pool
                            .schedule(move || client.write_done(ch, -(err as isize)));
                    }
                }
                return Err(err);
            }

            if n == 0 {
                break;
            }

            total += n as usize;

            // Pop fully-written buffers; trim a partial head.
            let mut left = n as usize;
            while left > 0 {
                let head_len = st.wbacklog.front().map(|b| b.len()).unwrap();
                if left >= head_len {
                    st.wbacklog.pop_front();
                    left -= head_len;

                    if is_async {
                        if let Some(client) = st.client.clone() {
                            let ch = self.clone();
                            let done = total as isize;
                            self.shared
                                .pool
                                .schedule(move || client.write_done(ch, done));
                        }
                    }
                } else {
                    st.wbacklog.front_mut().unwrap().cut_front(left);
                    left = 0;
                }
            }
        }

        Ok(total)
    }
}

impl FdHandler for TcpChannel {
    fn on_fd_event(&self, _fd: RawFd, events: u32) {
        let mut st = self.shared.state.lock().unwrap();

        if events & (EVENT_READ | EVENT_ERROR) != 0 {
            if let ReadOutcome::Complete(n, buf, handler) = self.drain_read(&mut st) {
                let ch = self.clone();
                self.shared
                    .pool
                    .schedule(move || handler(ch, n as isize, buf));
            }
        }

        if events & (EVENT_WRITE | EVENT_ERROR) != 0 {
            let _ = self.drain_write(&mut st, true);
        }
    }
}

impl Drop for ChannelShared {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            unsafe {
                libc::shutdown(self.fd, libc::SHUT_RDWR);
                libc::close(self.fd);
            }
        }
    }
}
