// netres — operator CLI for the resource distribution core
//
// `inspect` prints the core a file would be announced with; `demo` runs a
// full multi-peer transfer in-process over the loopback hub.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use netres_core::transport::LoopbackConn;
use netres_core::{
    archive, Config, LoopbackHub, ResList, ResType, Tunables, DEFAULT_CHUNK_SIZE,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "netres")]
#[command(about = "Peer-to-peer resource distribution toolbox")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the announce-time core computed for a file or directory
    Inspect {
        /// File or directory to inspect
        path: PathBuf,

        /// Chunk size used for the chunk count
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: u32,
    },

    /// Transfer a file between in-process peers over the loopback hub
    Demo {
        /// File to distribute; generated when omitted
        #[arg(long)]
        file: Option<PathBuf>,

        /// Number of receiving peers
        #[arg(long, default_value_t = 2)]
        peers: u16,

        /// Transfer chunk size in bytes
        #[arg(long, default_value_t = 4096)]
        chunk_size: u32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Inspect { path, chunk_size } => inspect(&path, chunk_size),
        Command::Demo {
            file,
            peers,
            chunk_size,
        } => demo(file.as_deref(), peers, chunk_size),
    }
}

fn inspect(path: &Path, chunk_size: u32) -> Result<()> {
    if !path.exists() {
        bail!("{} does not exist", path.display());
    }
    let contents_crc = archive::contents_crc(path)
        .with_context(|| format!("computing contents CRC of {}", path.display()))?;
    println!("{}  {}", "Path:".bold(), path.display());
    println!("{}  {:08x}", "ContentsCRC:".bold(), contents_crc);
    if path.is_file() {
        let size = fs::metadata(path)?.len();
        let file_crc = archive::file_crc(path)?;
        let sha = archive::file_sha1(path)?;
        let chunks = if size == 0 {
            0
        } else {
            (size - 1) / u64::from(chunk_size) + 1
        };
        println!("{}  {size}", "FileSize:".bold(),);
        println!("{}  {file_crc:08x}", "FileCRC:".bold());
        print!("{}  ", "FileSHA:".bold());
        for byte in sha {
            print!("{byte:02x}");
        }
        println!();
        println!("{}  {chunks} x {chunk_size} bytes", "Chunks:".bold());
        if archive::is_archive(path) {
            println!("{}  archive", "Form:".bold());
        } else {
            println!("{}  loose file", "Form:".bold());
        }
    } else {
        let size = archive::dir_size(path, u64::MAX)?;
        println!("{}  {} (directory, unpacked)", "FileSize:".bold(), size.total_bytes);
        println!("{}  directory (packed on announce)", "Form:".bold());
    }
    Ok(())
}

fn demo(file: Option<&Path>, peers: u16, chunk_size: u32) -> Result<()> {
    if peers == 0 {
        bail!("need at least one receiving peer");
    }
    if peers > 64 {
        bail!("more than 64 peers is not a demo anymore");
    }
    let root = std::env::temp_dir().join(format!("netres-demo-{}", std::process::id()));
    let result = run_demo(&root, file, peers, chunk_size);
    let _ = fs::remove_dir_all(&root);
    result
}

fn run_demo(root: &Path, file: Option<&Path>, peers: u16, chunk_size: u32) -> Result<()> {
    let hub = LoopbackHub::new();
    let make_peer = |client: u16| -> Result<ResList> {
        let exe = root.join(format!("peer{client}"));
        fs::create_dir_all(&exe)?;
        let mut config = Config::default();
        config.network.exe_path = exe.clone();
        config.network.work_path = exe.join("Network");
        config.tunables = Tunables {
            chunk_size,
            discover_interval: Duration::ZERO,
            status_interval: Duration::ZERO,
            ..Tunables::default()
        };
        ResList::new(config, client, hub.endpoint(client))
            .with_context(|| format!("initializing peer {client}"))
    };

    // peer 1 is the sender; peers 2.. receive
    let sender = make_peer(1)?;
    let receivers: Vec<(u16, ResList)> = (2..peers + 2)
        .map(|client| Ok((client, make_peer(client)?)))
        .collect::<Result<_>>()?;

    // stage the payload in the sender's directory
    let staged = root.join("peer1/payload.bin");
    match file {
        Some(src) => {
            fs::copy(src, &staged).with_context(|| format!("staging {}", src.display()))?;
        }
        None => {
            let generated: Vec<u8> = (0..256 * 1024).map(|i| (i % 249) as u8).collect();
            fs::write(&staged, generated)?;
        }
    }

    let res = sender
        .add_by_file(&staged, false, ResType::Dynamic, None, None, false)
        .map_err(|err| anyhow::anyhow!("installing payload: {err}"))?;
    let core = res.core();
    println!(
        "{} {} ({} bytes, {} chunks of {})",
        "distributing".green().bold(),
        core.filename(),
        core.file_size(),
        core.chunk_cnt(),
        core.chunk_size(),
    );

    let loading: Vec<_> = receivers
        .iter()
        .map(|(client, list)| {
            let res = list
                .add_by_core(&core, true)
                .map_err(|err| anyhow::anyhow!("peer {client}: {err}"))?;
            Ok((*client, res))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut everyone: Vec<(u16, &ResList)> = vec![(1, &sender)];
    everyone.extend(receivers.iter().map(|(client, list)| (*client, list)));

    for round in 1..=100 {
        for (_, list) in &everyone {
            list.on_timer();
        }
        loop {
            let mut any = false;
            for &(client, list) in &everyone {
                for (from, pkt) in hub.drain(client) {
                    let pkt = pkt.map_err(|err| anyhow::anyhow!("wire error: {err}"))?;
                    let conn = LoopbackConn::inbound(&hub, from, client);
                    list.handle_packet(&pkt, conn.as_ref());
                    any = true;
                }
            }
            if !any {
                break;
            }
        }

        let done = loading.iter().filter(|(_, res)| !res.is_loading()).count();
        println!(
            "round {round}: {} of {} peers complete",
            done,
            loading.len()
        );
        if done == loading.len() {
            break;
        }
    }

    let expected = fs::read(&staged)?;
    for (client, res) in &loading {
        if res.is_loading() || res.is_removed() {
            bail!("peer {client} never completed the transfer");
        }
        let bytes = fs::read(res.file_path())?;
        if bytes != expected {
            bail!("peer {client} holds different bytes");
        }
        println!(
            "peer {client}: {} ({} bytes)",
            "verified".green(),
            bytes.len()
        );
    }
    println!("{}", "all peers converged".green().bold());
    Ok(())
}
