//! The in-zone agent (§2: "the in-zone agent imports C1–C6").
//!
//! Runs inside a zone's mount/pid namespace, alongside the zone's own
//! init, and talks back to the host over the zone socket (§6.1,
//! `/run/vasum/zone.sock`). Unlike the host daemon it never touches
//! lxcpp directly — it only has a view of its own filesystem — so its
//! surface is intentionally tiny: answer `ping`, and on `request_reboot`,
//! drop the marker file the guard watches for (§B.7) and let the caller
//! decide when to actually exit.

use std::path::PathBuf;

use vasum_ipc::{PeerId, Service};

use crate::error::Result;
use crate::methods::zone_method_id;
use crate::state::ZoneStateDir;

pub struct Agent {
    service: Service,
}

impl Agent {
    pub fn start(socket_path: &std::path::Path, work_path: PathBuf) -> Result<Self> {
        let service = Service::bind(socket_path, 16)?;
        let state_dir = ZoneStateDir::new(&work_path);
        service.set_method_handler(
            zone_method_id::PING,
            0,
            Box::new(|_peer: PeerId, _payload, _fds, result| {
                result.complete(vasum_ipc::encode(&()).map_err(|e| vasum_ipc::UserError {
                    code: 0,
                    message: e.to_string(),
                }));
            }),
        )?;
        service.set_method_handler(
            zone_method_id::REQUEST_REBOOT,
            0,
            Box::new(move |_peer: PeerId, _payload, _fds, result| {
                let outcome = std::fs::write(state_dir.reboot_marker_path(), b"1")
                    .map_err(|e| vasum_ipc::UserError {
                        code: 6,
                        message: e.to_string(),
                    })
                    .and_then(|()| {
                        vasum_ipc::encode(&()).map_err(|e| vasum_ipc::UserError {
                            code: 0,
                            message: e.to_string(),
                        })
                    });
                result.complete(outcome);
            }),
        )?;
        Ok(Self { service })
    }

    pub fn stop(&self) {
        self.service.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;
    use vasum_ipc::Client;

    #[test]
    fn ping_round_trips() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("zone.sock");
        let agent = Agent::start(&socket, dir.path().to_path_buf()).unwrap();
        let client = Client::connect(&socket).unwrap();
        client
            .call::<(), ()>(zone_method_id::PING, &(), 0, Duration::from_secs(2))
            .unwrap();
        agent.stop();
    }

    #[test]
    fn request_reboot_writes_the_marker_file() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("zone.sock");
        let agent = Agent::start(&socket, dir.path().to_path_buf()).unwrap();
        let client = Client::connect(&socket).unwrap();
        client
            .call::<(), ()>(zone_method_id::REQUEST_REBOOT, &(), 0, Duration::from_secs(2))
            .unwrap();
        let state_dir = ZoneStateDir::new(dir.path());
        assert!(state_dir.reboot_marker_path().exists());
        agent.stop();
    }
}
