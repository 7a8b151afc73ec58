//! The in-zone agent binary: binds the zone socket (§6.1,
//! `/run/vasum/zone.sock`) and serves the tiny `zone_method_id` table
//! until signaled to stop.
//!
//! Unlike `vasumd` this never daemonizes — it's launched by the guard
//! as a child of the zone's own init, already detached from any
//! controlling terminal, and the guard expects it to stay in the
//! foreground so it can supervise it directly.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::Clap;
use nix::sys::signal::{self, SigHandler, Signal};

use vasum::agent::Agent;

#[derive(Clap, Debug)]
#[clap(version = "0.1.0", author = "vasum")]
struct Opts {
    /// Path to the zone socket this agent serves.
    #[clap(long)]
    socket: PathBuf,
    /// The zone's own work path, i.e. `${workPath}` of §6.4, so the
    /// agent can find `state/reboot` alongside the daemon's own files.
    #[clap(long)]
    work_path: PathBuf,
    #[clap(long)]
    log: Option<PathBuf>,
}

static SHOULD_STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_term(_: i32) {
    SHOULD_STOP.store(true, Ordering::Relaxed);
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    vasum::logger::init(opts.log.clone())?;

    if let Some(parent) = opts.socket.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let agent = Agent::start(&opts.socket, opts.work_path)?;
    log::info!("vsm-agent listening on {}", opts.socket.display());

    unsafe {
        signal::signal(Signal::SIGTERM, SigHandler::Handler(handle_term))?;
        signal::signal(Signal::SIGINT, SigHandler::Handler(handle_term))?;
    }

    while !SHOULD_STOP.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }

    log::info!("vsm-agent shutting down");
    agent.stop();
    Ok(())
}
