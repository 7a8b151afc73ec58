//! `vsm-launch-pad <name>` (§6.2): starts the zone described by
//! `/etc/vasum/zones/<name>.conf` through the running host daemon.
//!
//! Grounded on the teacher's `src/main.rs` subcommand binary shape, cut
//! down to the single-purpose launcher §6.2 describes rather than the
//! teacher's full OCI subcommand set. Exit codes follow §6.2 literally:
//! 0 success, 1 config error, 2 runtime error, 3 already running.

use std::process::ExitCode;
use std::time::Duration;

use clap::Clap;

use vasum::config::Paths;
use vasum::methods::{method_id, CreateZoneArgs, NameArg};
use vasum_ipc::Client;

#[derive(Clap, Debug)]
#[clap(version = "0.1.0", author = "vasum")]
struct Opts {
    /// Name of the zone, as it appears under the zone config directory.
    name: String,
    /// Stay attached and wait for the zone to exit instead of returning
    /// as soon as it has started.
    #[clap(long)]
    foreground: bool,
    #[clap(long)]
    log: Option<std::path::PathBuf>,
}

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

fn main() -> ExitCode {
    let opts = Opts::parse();
    if let Err(e) = vasum::logger::init(opts.log.clone()) {
        eprintln!("failed to initialize logger: {}", e);
    }

    let paths = Paths::default();
    match run(&paths, &opts) {
        Ok(code) => code,
        Err(e) => {
            log::error!("vsm-launch-pad: {}", e);
            ExitCode::from(2)
        }
    }
}

fn run(paths: &Paths, opts: &Opts) -> anyhow::Result<ExitCode> {
    let config_path = paths.zone_config_path(&opts.name);
    if !config_path.exists() {
        eprintln!("no such zone config: {}", config_path.display());
        return Ok(ExitCode::from(1));
    }

    let client = Client::connect(&paths.control_socket)?;

    let create_result = client.call::<CreateZoneArgs, ()>(
        method_id::CREATE_ZONE,
        &CreateZoneArgs {
            name: opts.name.clone(),
            template: opts.name.clone(),
        },
        0,
        CALL_TIMEOUT,
    );
    match create_result {
        Err(vasum_ipc::Error::UserError { code: 2, .. }) => return Ok(ExitCode::from(3)),
        Err(vasum_ipc::Error::UserError { code: 6, .. }) | Err(vasum_ipc::Error::UserError { code: 7, .. }) => {
            return Ok(ExitCode::from(1))
        }
        other => other?,
    };

    client.call::<NameArg, ()>(
        method_id::START_ZONE,
        &NameArg { name: opts.name.clone() },
        0,
        CALL_TIMEOUT,
    )?;

    log::info!("zone {} started", opts.name);

    if opts.foreground {
        wait_until_stopped(&client, &opts.name)?;
    }

    Ok(ExitCode::from(0))
}

/// Polls `get_zone_info` until the zone reports `Stopped` — a simple
/// stand-in for subscribing to `zone_state_changed` when all the caller
/// wants is to block until exit.
fn wait_until_stopped(client: &Client, name: &str) -> anyhow::Result<()> {
    use vasum::methods::ZoneInfo;
    use lxcpp::container::ContainerState;

    loop {
        let info: ZoneInfo = client.call(
            method_id::GET_ZONE_INFO,
            &NameArg { name: name.to_string() },
            0,
            CALL_TIMEOUT,
        )?;
        if info.state == ContainerState::Stopped {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(500));
    }
}
