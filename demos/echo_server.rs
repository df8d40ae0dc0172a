use std::net::{Ipv4Addr, SocketAddr};

use anyhow::Context;
use clap::Parser;
use log::{debug, error, info};
use tether::{
    futures::combinators::iterate,
    net::Channel,
    reactor::{BindOptions, Reactor, SocketOption},
};

/// A tether echo server.
///
/// Every connection gets back whatever it sends until it closes its side.
#[derive(Parser, Debug)]
struct Args {
    /// The port number that the server should listen on.
    #[arg(short, long, default_value_t = 5000)]
    port: u16,

    /// Number of worker threads.
    #[arg(short, long, default_value_t = 4)]
    workers: usize,
}

fn echo(channel: Channel) -> tether::Result<()> {
    let peer = channel.peer_addr()?;
    debug!("connection from {peer}");

    let conn = channel.clone();
    let done = iterate(channel.read(vec![0; 4096]), move |chunk| {
        if chunk.is_empty() {
            return None;
        }

        let ch = conn.clone();
        Some(ch.write(chunk.clone()).then(move |_| ch.read(vec![0; 4096])))
    });

    done.on_complete(move |outcome| {
        match outcome.error() {
            Some(e) => error!("connection from {peer} failed: {e}"),
            None => debug!("connection from {peer} finished"),
        }

        channel.close();
    });

    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();

    let reactor = Reactor::builder()
        .worker_threads(args.workers)
        .build()
        .context("Could not start reactor")?;

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port));
    let server = reactor
        .bind(BindOptions::new(addr, echo).option(SocketOption::NoDelay(true)))
        .get()
        .context("Could not setup socket listener")?;

    info!("Listening on {}", server.local_addr());
    println!("Waiting for connections on {}", server.local_addr());

    // Serve until the process is killed.
    loop {
        std::thread::park();
    }
}
