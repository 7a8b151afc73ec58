//! The host daemon binary: binds the control socket and serves the §6.1
//! method table until signaled to stop.
//!
//! Grounded on the teacher's `src/main.rs` entry point — logger init
//! then dispatch — collapsed to a single long-running command since the
//! daemon has no subcommands of its own (those live in `vsm-launch-pad`
//! and, eventually, a separate zone-management CLI out of scope here).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::Clap;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd;

use vasum::config::Paths;
use vasum::daemon::Daemon;

#[derive(Clap, Debug)]
#[clap(version = "0.1.0", author = "vasum")]
struct Opts {
    /// Control socket path, overriding the §6.1 default.
    #[clap(long)]
    socket: Option<PathBuf>,
    #[clap(long)]
    log: Option<PathBuf>,
    /// Stay in the foreground instead of daemonizing.
    #[clap(long)]
    foreground: bool,
}

static SHOULD_STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_term(_: i32) {
    SHOULD_STOP.store(true, Ordering::Relaxed);
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    vasum::logger::init(opts.log.clone())?;

    if !opts.foreground {
        daemonize()?;
    }

    let mut paths = Paths::default();
    if let Some(socket) = opts.socket {
        paths.control_socket = socket;
    }
    if let Some(parent) = paths.control_socket.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let daemon = Daemon::start(paths)?;
    log::info!("vasumd listening");

    unsafe {
        signal::signal(Signal::SIGTERM, SigHandler::Handler(handle_term))?;
        signal::signal(Signal::SIGINT, SigHandler::Handler(handle_term))?;
    }

    while !SHOULD_STOP.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }

    log::info!("vasumd shutting down");
    daemon.stop();
    Ok(())
}

/// A minimal double-fork daemonize, mirroring the teacher's rootless/exec
/// double-fork idiom (`src/rootless.rs`) rather than pulling in a
/// dedicated daemonize crate for the one thing it's used for here.
fn daemonize() -> Result<()> {
    match unsafe { unistd::fork()? } {
        unistd::ForkResult::Parent { .. } => std::process::exit(0),
        unistd::ForkResult::Child => {}
    }
    unistd::setsid()?;
    match unsafe { unistd::fork()? } {
        unistd::ForkResult::Parent { .. } => std::process::exit(0),
        unistd::ForkResult::Child => {}
    }
    let _ = unistd::close(0);
    let _ = unistd::close(1);
    let _ = unistd::close(2);
    Ok(())
}
