use std::{fs::File, path::PathBuf};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use ptkit_packet::{Config, Error, PacketDecoder};
use ptkit_query::{EventKind, QueryDecoder};

/// Dump Intel PT packets or events from a raw trace file.
///
/// Set the environment variable `RUST_LOG=trace` for decoder logging.
#[derive(Parser)]
struct Cmdline {
    /// Path of the raw Intel PT trace
    #[arg(short, long)]
    input: PathBuf,
    /// What to walk. Default is packets
    #[arg(short, long, value_enum)]
    layer: Option<Layer>,
}

/// The decoder layer to walk
#[derive(ValueEnum, Clone, Copy, Default)]
enum Layer {
    /// One line per packet
    #[default]
    Packets,
    /// One line per query-level event
    Events,
}

fn dump_packets(buf: &[u8]) -> anyhow::Result<()> {
    let mut decoder = PacketDecoder::new(Config::new(buf));

    loop {
        match decoder.sync_forward() {
            Ok(offset) => println!("[sync @ {offset:#010x}]"),
            Err(Error::Eos) => return Ok(()),
            Err(error) => return Err(error).context("sync failed"),
        }

        loop {
            let offset = decoder.offset().context("decoder lost its position")?;
            match decoder.next() {
                Ok(packet) => println!("{offset:#010x}  {packet}"),
                Err(Error::Eos) => return Ok(()),
                Err(error) => {
                    // Skip to the next sync point, as a consumer would.
                    println!("{offset:#010x}  error: {error}");
                    break;
                }
            }
        }
    }
}

fn dump_events(buf: &[u8]) -> anyhow::Result<()> {
    let mut decoder = QueryDecoder::new(Config::new(buf));

    loop {
        match decoder.sync_forward() {
            Ok((_, ip)) => match ip {
                Some(ip) => println!("[sync, ip {ip:#x}]"),
                None => println!("[sync, no ip]"),
            },
            Err(Error::Eos) => return Ok(()),
            Err(error) => return Err(error).context("sync failed"),
        }

        loop {
            let status = decoder.status();
            if status.event_pending {
                let Ok((event, _)) = decoder.event() else {
                    break;
                };
                let update = if event.status_update { " (status)" } else { "" };
                match event.kind {
                    EventKind::Enabled { ip } => println!("enabled   {ip:#x}{update}"),
                    EventKind::Disabled { ip } => println!("disabled  {ip:#x}{update}"),
                    EventKind::AsyncDisabled { at, ip } => {
                        println!("disabled  {ip:#x} at {at:#x}{update}");
                    }
                    EventKind::AsyncBranch { from, to } => {
                        println!("interrupt {from:#x} -> {to:#x}{update}");
                    }
                    EventKind::Paging { cr3 } | EventKind::AsyncPaging { cr3, .. } => {
                        println!("paging    cr3 {cr3:#x}{update}");
                    }
                    EventKind::Overflow { ip } => println!("overflow  {ip:#x}{update}"),
                    EventKind::ExecMode { mode, ip } => {
                        println!("mode      {mode} at {ip:#x}{update}");
                    }
                    EventKind::Tsx {
                        ip,
                        speculative,
                        aborted,
                    } => {
                        println!("tsx       {ip:#x} intx {speculative} abrt {aborted}{update}");
                    }
                }
            } else if let Ok((ip, _)) = decoder.indirect_branch() {
                match ip {
                    Some(ip) => println!("branch    -> {ip:#x}"),
                    None => println!("branch    -> suppressed"),
                }
            } else if let Ok((taken, _)) = decoder.cond_branch() {
                println!("cond      {}", if taken { "taken" } else { "not taken" });
            } else {
                break;
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let Cmdline { input, layer } = Cmdline::parse();

    let file = File::open(&input).context("Failed to open input file")?;
    // SAFETY: check the safety requirements of memmap2 documentation
    let buf = unsafe { memmap2::Mmap::map(&file).context("Failed to mmap input file")? };

    match layer.unwrap_or_default() {
        Layer::Packets => dump_packets(&buf),
        Layer::Events => dump_events(&buf),
    }
}
