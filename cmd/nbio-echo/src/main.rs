//! # nbio-echo — block-echo server
//!
//! Reads fixed-size blocks and writes each one straight back:
//!
//!   nbio-echo --laddr 0.0.0.0:9000 --iosize 4096 --ncpu 2
//!
//! Reads complete only when a full block arrived, so this echoes
//! `--iosize`-aligned streams (pair it with nbio-bmark --client).

use nbio::{
    nb_error, nb_warn, ChannelClient, EventLoop, IoBuffer, RuntimeConfig, TcpChannel,
    TcpListener, ThreadPool,
};
use std::net::SocketAddrV4;
use std::sync::{Arc, Weak};

struct EchoServer {
    iosize: usize,
    me: Weak<EchoServer>,
}

impl EchoServer {
    fn start(pool: ThreadPool, eloop: EventLoop, laddr: SocketAddrV4, iosize: usize) -> Arc<Self> {
        let me = Arc::new_cyclic(|weak| Self {
            iosize,
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
                let ch = ch.expect("accept without a channel");
                let me = accept_me.me.upgrade().expect("server gone");
                ch.register_client(me.clone());
                me.echo_loop(ch);
            }),
        );
        println!("echoing {}-byte blocks at {}", iosize, listener.local_addr());
        me
    }

    fn echo_loop(self: Arc<Self>, ch: TcpChannel) {
        loop {
            let me = self.clone();
            let res = ch.read(
                IoBuffer::alloc(self.iosize),
                Box::new(move |ch, status, buf| {
                    if status < 0 {
                        nb_error!("read failed on fd {}: status {}", ch.fd(), status);
                        return;
                    }
                    me.echo_back(&ch, buf);
                    me.clone().echo_loop(ch);
                }),
            );

            match res {
                Some((_, buf)) => {
                    self.echo_back(&ch, buf);
                    // completed synchronously; read the next block
                }
                None => break,
            }
        }
    }

    fn echo_back(&self, ch: &TcpChannel, buf: IoBuffer) {
        if let Err(e) = ch.enqueue_write(buf) {
            // backpressure or a dead peer: drop the block
            nb_warn!("echo dropped a block on fd {}: {}", ch.fd(), e);
        }
    }
}

impl ChannelClient for EchoServer {
    fn write_done(&self, _ch: TcpChannel, status: isize) {
        if status < 0 {
            nb_error!("echo write failed: status {}", status);
        }
    }
}

fn usage() {
    eprintln!("nbio-echo: block-echo server");
    eprintln!();
    eprintln!("  -l, --laddr ADDR    listen address (default 0.0.0.0:9000)");
    eprintln!("  -i, --iosize BYTES  block size in bytes (default 4096)");
    eprintln!("  -p, --ncpu N        worker threads (default 2)");
    eprintln!("  -h, --help          print this help");
}

fn main() {
    let mut laddr = "0.0.0.0:9000".to_string();
    let mut iosize = 4 * 1024usize;
    let mut ncpu = 2usize;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |name: &str| {
            it.next().unwrap_or_else(|| {
                eprintln!("error: {} needs a value", name);
                std::process::exit(-1);
            })
        };
        match arg.as_str() {
            "-l" | "--laddr" => laddr = value("--laddr"),
            "-i" | "--iosize" => {
                iosize = value("--iosize").parse().unwrap_or_else(|_| {
                    eprintln!("error: --iosize: not a number");
                    std::process::exit(-1);
                })
            }
            "-p" | "--ncpu" => {
                ncpu = value("--ncpu").parse().unwrap_or_else(|_| {
                    eprintln!("error: --ncpu: not a number");
                    std::process::exit(-1);
                })
            }
            "-h" | "--help" => {
                usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("error: unknown option: {}", other);
                usage();
                std::process::exit(-1);
            }
        }
    }

    let addr: SocketAddrV4 = laddr.parse().unwrap_or_else(|_| {
        eprintln!("error: --laddr: not an IPv4 addr:port: {}", laddr);
        std::process::exit(-1);
    });

    nbio::init_logging();

    let pool = ThreadPool::new();
    pool.start(RuntimeConfig::from_env().num_workers(ncpu));
    let eloop = EventLoop::start("echo").expect("event loop start failed");

    let _server = EchoServer::start(pool.clone(), eloop, addr, iosize);

    // Runs until killed.
    pool.wait();
}
