use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::Context;
use clap::Parser;
use tether::{
    futures::combinators::for_each,
    reactor::{ConnectOptions, Reactor},
};

/// Send pings to an echo server and report the round trip times.
#[derive(Parser, Debug)]
struct Args {
    /// Address of the echo server.
    #[arg(default_value = "127.0.0.1:5000")]
    addr: SocketAddr,

    /// Number of pings to send.
    #[arg(short, long, default_value_t = 5)]
    count: usize,

    /// Milliseconds to wait between pings.
    #[arg(short, long, default_value_t = 500)]
    interval: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    let reactor = Arc::new(Reactor::new().context("Could not start reactor")?);

    let channel = reactor
        .connect(ConnectOptions::new(args.addr))
        .get()
        .context("Could not connect")?;

    let rtts = Arc::new(Mutex::new(Vec::new()));
    let interval = Duration::from_millis(args.interval);

    let ch = channel.clone();
    let r = reactor.clone();
    let times = rtts.clone();
    let pings = for_each(0..args.count, move |seq| {
        let ch = ch.clone();
        let times = times.clone();
        let sent = Instant::now();
        let msg = format!("PING {seq}").into_bytes();

        let reply = ch
            .write(msg)
            .then(move |_| ch.read(vec![0; 64]))
            .map(move |reply| {
                let rtt = sent.elapsed();
                println!(
                    "{} from {}: seq={seq} time={rtt:?}",
                    String::from_utf8_lossy(reply),
                    args.addr
                );
                times.lock().unwrap().push(rtt);
            });

        let r = r.clone();
        reply.then(move |_| r.delay(interval))
    });

    pings.get().context("Ping failed")?;
    channel.close();

    let rtts = rtts.lock().unwrap();
    if let Some(max) = rtts.iter().max() {
        let avg = rtts.iter().sum::<Duration>() / rtts.len() as u32;
        eprintln!("{} pings, avg {avg:?}, max {max:?}", rtts.len());
    }

    Ok(())
}
