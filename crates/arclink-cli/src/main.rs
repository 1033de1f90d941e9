//! Headless host for the cabinet link bridge.
//!
//! Drives one emulated link device at a downsampled tick rate. With
//! `--forward` the node relays everything it receives to the next peer,
//! which is how more than two cabinets are chained through one process; with
//! `--pattern` it exercises the link with generated transfers.

mod config;

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{debug, info};

use arclink_core::device::LinkDevice;
use arclink_core::transport::{LinkConfig, LinkEvent, LinkTransport};

use config::load_from_file;

const TICK_BATCH: u32 = 256;
const BATCH_INTERVAL: Duration = Duration::from_millis(2);

const REG_RXSIZE: usize = 4;
const REG_TXSIZE: usize = 5;
const REG_RXOFFSET: usize = 6;
const REG_TXOFFSET: usize = 7;

#[derive(Parser)]
struct Args {
    /// Path to a TOML file with the link settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Local host the receive role listens on
    #[arg(long)]
    local_host: Option<String>,

    /// Local port the receive role listens on
    #[arg(long)]
    local_port: Option<String>,

    /// Remote host the transmit role connects to
    #[arg(long)]
    remote_host: Option<String>,

    /// Remote port the transmit role connects to
    #[arg(long)]
    remote_port: Option<String>,

    /// Relay every received chunk to the remote peer (chain mode)
    #[arg(long)]
    forward: bool,

    /// Exercise the link with generated transfers
    #[arg(long)]
    pattern: bool,

    /// Number of seconds to run (default: until killed)
    #[arg(long)]
    seconds: Option<u64>,
}

fn effective_config(args: &Args) -> LinkConfig {
    let mut config = match &args.config {
        Some(path) => match load_from_file(path) {
            Ok(file) => file.into_link_config(),
            Err(e) => {
                eprintln!("Failed to load config {}: {e}", path.display());
                std::process::exit(2);
            }
        },
        None => LinkConfig::default(),
    };

    if let Some(host) = &args.local_host {
        config.local_host = host.clone();
    }
    if let Some(port) = &args.local_port {
        config.local_port = port.clone();
    }
    if let Some(host) = &args.remote_host {
        config.remote_host = host.clone();
    }
    if let Some(port) = &args.remote_port {
        config.remote_port = port.clone();
    }
    if args.forward {
        config.forward = true;
    }
    config
}

/// Writes an incrementing word pattern into RAM and schedules a transfer
/// whenever the previous one has completed.
struct PatternSource {
    enabled: bool,
    next_word: u16,
    rounds: u64,
}

impl PatternSource {
    const WORDS: u16 = 8;

    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            next_word: 0,
            rounds: 0,
        }
    }

    fn pump(&mut self, device: &mut LinkDevice) {
        if !self.enabled || !device.link_connected() {
            return;
        }
        if device.read_reg(REG_TXSIZE) != 0 {
            return; // previous transfer still on the wire
        }

        for slot in 0..Self::WORDS {
            // bit 8 set keeps the peer's sync detection exercised
            device.write_ram(slot as usize, 0x0100 | (self.next_word & 0x00ff));
            self.next_word = self.next_word.wrapping_add(1);
        }
        device.write_reg(REG_TXOFFSET, 0);
        device.write_reg(REG_RXOFFSET, 0);
        device.write_reg(REG_RXSIZE, Self::WORDS);
        device.write_reg(REG_TXSIZE, Self::WORDS);

        self.rounds += 1;
        if self.rounds.is_multiple_of(64) {
            info!("pattern: {} transfer rounds scheduled", self.rounds);
            debug!(
                "pattern: peer words at 0x1000: {:04x} {:04x}",
                device.read_ram(0x1000),
                device.read_ram(0x1001)
            );
        }
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    let config = effective_config(&args);

    let transport = LinkTransport::start();
    let events = transport.events();

    let mut device = LinkDevice::new();
    device.connect_link(Box::new(transport));
    device.reset(&config);

    info!(
        "link node up: {}:{} <- local, remote -> {}:{} (id {:02x}{})",
        config.local_host,
        config.local_port,
        config.remote_host,
        config.remote_port,
        device.link_id(),
        if config.forward { ", forwarding" } else { "" },
    );

    let until = args.seconds.map(|s| Instant::now() + Duration::from_secs(s));
    let mut pattern = PatternSource::new(args.pattern);

    loop {
        if let Some(deadline) = until
            && Instant::now() >= deadline
        {
            break;
        }

        while let Ok(event) = events.try_recv() {
            match event {
                LinkEvent::Listening(addr) => info!("listening on {addr}"),
                LinkEvent::RxConnected(addr) => info!("peer connected from {addr}"),
                LinkEvent::RxLost => info!("peer connection lost"),
                LinkEvent::TxConnected(addr) => info!("connected to peer {addr}"),
                LinkEvent::TxLost => info!("peer link dropped"),
            }
        }

        for _ in 0..TICK_BATCH {
            device.tick();
        }
        pattern.pump(&mut device);

        thread::sleep(BATCH_INTERVAL);
    }

    device.stop();
}
