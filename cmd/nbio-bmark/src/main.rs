//! # nbio-bmark — TCP throughput benchmark
//!
//! One binary, two mutually exclusive modes:
//!
//!   nbio-bmark --server --laddr 0.0.0.0:9000 --ncpu 4
//!   nbio-bmark --client --raddr 127.0.0.1:9000 --iosize 4096 \
//!              --conn 4 --time 60 --ncpu 4
//!
//! The server accepts connections and sinks fixed-size reads, counting
//! bytes per channel. The client opens `--conn` connections and writes
//! `--iosize` random buffers as fast as completions allow for `--time`
//! seconds, then reports per-channel throughput.
//!
//! Exit code 0 on clean shutdown, -1 on argument error.

use nbio::{
    nb_error, nb_info, ChannelClient, EventLoop, IoBuffer, NetError, PerfCounter,
    RuntimeConfig, SocketAddress, Stopwatch, TcpChannel, TcpConnector, TcpListener, ThreadPool,
};
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

// ═══════════════════════════════════════════════════════════════════
// Arguments
// ═══════════════════════════════════════════════════════════════════

struct Args {
    server: bool,
    client: bool,
    laddr: String,
    raddr: String,
    iosize: usize,
    nconn: usize,
    seconds: u64,
    ncpu: usize,
}

impl Args {
    fn defaults() -> Self {
        Self {
            server: false,
            client: false,
            laddr: "0.0.0.0:0".to_string(),
            raddr: String::new(),
            iosize: 4 * 1024,
            nconn: 1,
            seconds: 60,
            ncpu: 8,
        }
    }
}

fn usage() {
    eprintln!("nbio-bmark: TCP throughput benchmark");
    eprintln!();
    eprintln!("  -s, --server          run the server (sink) component");
    eprintln!("  -c, --client          run the client (source) component");
    eprintln!("  -l, --laddr ADDR      local address (default 0.0.0.0:0)");
    eprintln!("  -r, --raddr ADDR      remote address (client only)");
    eprintln!("  -i, --iosize BYTES    I/O size in bytes (default 4096)");
    eprintln!("  -n, --conn N          client connections (default 1)");
    eprintln!("  -t, --time SECONDS    run time, client only (default 60)");
    eprintln!("  -p, --ncpu N          worker threads (default 8)");
    eprintln!("  -h, --help            print this help");
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args::defaults();
    let mut it = std::env::args().skip(1);

    while let Some(arg) = it.next() {
        let mut value = |name: &str| {
            it.next().ok_or_else(|| format!("{} needs a value", name))
        };
        match arg.as_str() {
            "-s" | "--server" => args.server = true,
            "-c" | "--client" => args.client = true,
            "-l" | "--laddr" => args.laddr = value("--laddr")?,
            "-r" | "--raddr" => args.raddr = value("--raddr")?,
            "-i" | "--iosize" => {
                args.iosize = value("--iosize")?
                    .parse()
                    .map_err(|_| "--iosize: not a number".to_string())?
            }
            "-n" | "--conn" => {
                args.nconn = value("--conn")?
                    .parse()
                    .map_err(|_| "--conn: not a number".to_string())?
            }
            "-t" | "--time" => {
                args.seconds = value("--time")?
                    .parse()
                    .map_err(|_| "--time: not a number".to_string())?
            }
            "-p" | "--ncpu" => {
                args.ncpu = value("--ncpu")?
                    .parse()
                    .map_err(|_| "--ncpu: not a number".to_string())?
            }
            "-h" | "--help" => {
                usage();
                std::process::exit(0);
            }
            other => return Err(format!("unknown option: {}", other)),
        }
    }

    if args.server == args.client {
        return Err("exactly one of --server / --client is required".to_string());
    }
    if args.client && args.raddr.is_empty() {
        return Err("--client needs --raddr".to_string());
    }
    if args.iosize == 0 || args.nconn == 0 {
        return Err("--iosize and --conn must be positive".to_string());
    }
    Ok(args)
}

fn parse_v4(s: &str, what: &str) -> SocketAddrV4 {
    s.parse().unwrap_or_else(|_| {
        eprintln!("{}: not an IPv4 addr:port: {}", what, s);
        std::process::exit(-1);
    })
}

// ═══════════════════════════════════════════════════════════════════
// Per-channel stats
// ═══════════════════════════════════════════════════════════════════

struct ChStats {
    started: Stopwatch,
    bytes_read: u64,
    bytes_written: u64,
}

impl ChStats {
    fn new() -> Self {
        Self {
            started: Stopwatch::start(),
            bytes_read: 0,
            bytes_written: 0,
        }
    }
}

fn mbps(bytes: u64, secs: f64) -> f64 {
    if secs <= 0.0 {
        return 0.0;
    }
    bytes as f64 / (1024.0 * 1024.0) / secs
}

// ═══════════════════════════════════════════════════════════════════
// Server: accept and sink reads
// ═══════════════════════════════════════════════════════════════════

struct ServerBench {
    iosize: usize,
    stats: Mutex<HashMap<RawFd, ChStats>>,
    me: Weak<ServerBench>,
}

impl ServerBench {
    fn start(pool: ThreadPool, eloop: EventLoop, laddr: SocketAddrV4, iosize: usize) -> Arc<Self> {
        let me = Arc::new_cyclic(|weak| Self {
            iosize,
            stats: Mutex::new(HashMap::new()),
            me: weak.clone(),
        });

        let listener = TcpListener::new(pool, eloop);
        let accept_me = me.clone();
        listener.listen(
            laddr,
            Arc::new(move |status, ch| {
                if status < 0 {
                    nb_error!("accept failed: status {}", status);
                    return;
                }
                accept_me.handle_connection(ch.expect("accept without a channel"));
            }),
        );
        nb_info!("server sinking {}-byte reads at {}", iosize, listener.local_addr());
        me
    }

    fn handle_connection(&self, ch: TcpChannel) {
        println!("accepted channel fd {}", ch.fd());
        self.stats.lock().unwrap().insert(ch.fd(), ChStats::new());

        let me = self.me.upgrade().expect("server gone");
        ch.register_client(me.clone());
        me.read_loop(ch);
    }

    fn read_loop(self: Arc<Self>, ch: TcpChannel) {
        loop {
            let me = self.clone();
            let res = ch.read(
                IoBuffer::alloc(self.iosize),
                Box::new(move |ch, status, _buf| {
                    if status < 0 {
                        nb_error!("read failed on fd {}: status {}", ch.fd(), status);
                        return;
                    }
                    me.record_read(&ch, status as u64);
                    me.clone().read_loop(ch);
                }),
            );

            match res {
                Some((n, _buf)) => {
                    self.record_read(&ch, n as u64);
                    // completed synchronously; issue the next read
                }
                None => break,
            }
        }
    }

    fn record_read(&self, ch: &TcpChannel, n: u64) {
        let mut stats = self.stats.lock().unwrap();
        if let Some(st) = stats.get_mut(&ch.fd()) {
            st.bytes_read += n;
        }
    }
}

impl ChannelClient for ServerBench {
    fn write_done(&self, _ch: TcpChannel, _status: isize) {
        // the sink never writes
    }
}

// ═══════════════════════════════════════════════════════════════════
// Client: connect and stream writes
// ═══════════════════════════════════════════════════════════════════

struct ClientBench {
    pool: ThreadPool,
    iosize: usize,
    nconn: usize,
    seconds: u64,
    timer: Stopwatch,
    stats: Mutex<HashMap<RawFd, ChStats>>,
    finished: AtomicUsize,
    me: Weak<ClientBench>,
}

impl ClientBench {
    fn start(
        pool: ThreadPool,
        eloop: EventLoop,
        addr: SocketAddress,
        iosize: usize,
        nconn: usize,
        seconds: u64,
    ) -> Arc<Self> {
        let me = Arc::new_cyclic(|weak| Self {
            pool: pool.clone(),
            iosize,
            nconn,
            seconds,
            timer: Stopwatch::start(),
            stats: Mutex::new(HashMap::new()),
            finished: AtomicUsize::new(0),
            me: weak.clone(),
        });

        let connector = TcpConnector::new(pool, eloop);
        for _ in 0..nconn {
            let conn_me = me.clone();
            connector.connect(
                addr,
                Box::new(move |status, ch| {
                    if status < 0 {
                        nb_error!("connect failed: status {}", status);
                        std::process::exit(1);
                    }
                    conn_me.on_connected(ch.expect("connect without a channel"));
                }),
            );
        }
        me
    }

    fn on_connected(&self, ch: TcpChannel) {
        self.stats.lock().unwrap().insert(ch.fd(), ChStats::new());

        let me = self.me.upgrade().expect("client gone");
        ch.register_client(me.clone());
        me.send(ch);
    }

    fn elapsed_done(&self) -> bool {
        self.timer.elapsed_ms() >= self.seconds * 1000
    }

    /// Write buffers until the socket pushes back or time is up.
    fn send(self: Arc<Self>, ch: TcpChannel) {
        loop {
            if self.elapsed_done() {
                self.finish_channel(ch);
                return;
            }

            let mut buf = IoBuffer::alloc(self.iosize);
            buf.fill_random();

            match ch.enqueue_write(buf) {
                Ok(n) if n == self.iosize => {
                    self.record_write(&ch, self.iosize as u64);
                    // fully written synchronously; go again
                }
                Ok(_) => {
                    // remainder drains on the writable edge; the
                    // write_done completion resumes the loop
                    return;
                }
                Err(NetError::Busy) => {
                    // backpressure: retry shortly
                    let me = self.clone();
                    self.pool.schedule_in(1, move || me.send(ch));
                    return;
                }
                Err(e) => {
                    nb_error!("write failed on fd {}: {}", ch.fd(), e);
                    self.finish_channel(ch);
                    return;
                }
            }
        }
    }

    fn record_write(&self, ch: &TcpChannel, n: u64) {
        let mut stats = self.stats.lock().unwrap();
        if let Some(st) = stats.get_mut(&ch.fd()) {
            st.bytes_written += n;
        }
    }

    /// Retire the channel; the last one reports and wakes main.
    fn finish_channel(&self, ch: TcpChannel) {
        let me = self.me.upgrade().expect("client gone");
        let client: Arc<dyn ChannelClient> = me.clone();

        let done_me = me.clone();
        let done_ch = ch.clone();
        ch.unregister_client(
            &client,
            Box::new(move |status| {
                assert_eq!(status, 0);
                done_ch.close();

                if done_me.finished.fetch_add(1, Ordering::AcqRel) + 1 == done_me.nconn {
                    done_me.print_stats();
                    done_me.pool.wakeup();
                }
            }),
        );
    }

    fn print_stats(&self) {
        let stats = self.stats.lock().unwrap();
        let secs = self.timer.elapsed_secs_f64();

        let mut total = 0u64;
        let mut per_channel = PerfCounter::new("write-throughput", "MBps");
        for (fd, st) in stats.iter() {
            println!("channel fd {} :", fd);
            println!("  w-bytes          {} bytes", st.bytes_written);
            println!("  time             {:.1} s", secs);
            println!("  write throughput {:.1} MBps", mbps(st.bytes_written, secs));
            per_channel.record(mbps(st.bytes_written, secs) as u64);
            total += st.bytes_written;
        }
        println!("{}", per_channel);
        println!(
            "total: {} bytes over {} connections, {:.1} MBps",
            total,
            stats.len(),
            mbps(total, secs)
        );
    }
}

impl ChannelClient for ClientBench {
    fn write_done(&self, ch: TcpChannel, status: isize) {
        if status < 0 {
            nb_error!("write failed on fd {}: status {}", ch.fd(), status);
            self.finish_channel(ch);
            return;
        }

        // One buffer fully drained.
        self.record_write(&ch, self.iosize as u64);

        let me = self.me.upgrade().expect("client gone");
        if self.elapsed_done() {
            self.finish_channel(ch);
        } else {
            me.send(ch);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════
// Main
// ═══════════════════════════════════════════════════════════════════

fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("error: {}", msg);
            eprintln!();
            usage();
            std::process::exit(-1);
        }
    };

    nbio::init_logging();

    let pool = ThreadPool::new();
    pool.start(RuntimeConfig::from_env().num_workers(args.ncpu));
    let eloop = EventLoop::start("bmark").expect("event loop start failed");

    if args.client {
        println!(
            "benchmark: {} -> {} iosize {} conn {} ncpu {} time {} s",
            args.laddr, args.raddr, args.iosize, args.nconn, args.ncpu, args.seconds
        );

        let addr = SocketAddress::new(
            parse_v4(&args.laddr, "--laddr"),
            parse_v4(&args.raddr, "--raddr"),
        );
        let _client = ClientBench::start(
            pool.clone(),
            eloop.clone(),
            addr,
            args.iosize,
            args.nconn,
            args.seconds,
        );

        pool.wait();
        eloop.shutdown();
        pool.shutdown();
    } else {
        println!("server at {} ncpu {}", args.laddr, args.ncpu);

        let _server = ServerBench::start(
            pool.clone(),
            eloop,
            parse_v4(&args.laddr, "--laddr"),
            args.iosize,
        );

        // Runs until killed.
        pool.wait();
    }

    std::process::exit(0);
}
