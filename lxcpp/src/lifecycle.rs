//! Container lifecycle orchestration (§4.12, C12): the guard→init→user
//! process chain, the six-step synchronization handshake, and the
//! STOPPED/STARTING/RUNNING/STOPPING/PAUSED state machine.
//!
//! Grounded on the teacher's `src/process/{container_main_process,
//! container_intermediate_process,container_init_process}.rs`, renamed to
//! the guard/init vocabulary from §4.12 and extended from the teacher's two
//! sync messages to the six named steps (`process/message.rs`). The
//! teacher's separate intermediate process is folded into `run_guard`
//! itself: lxcpp's `clone()` (`process/fork.rs`) already enters every
//! requested namespace in the same syscall that creates init, so no
//! separate unshare-then-fork pass is needed.

use std::os::unix::io::RawFd;
use std::path::PathBuf;

use nix::sys::signal::{self, Signal};
use nix::sys::socket::{self, AddressFamily, SockFlag, SockType};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, Pid};

use cgroups::cgroup::CGroup;
use cgroups::manager::assign_pid_all;
use cgroups::subsystem::Subsystem;

use crate::container::{ContainerState, State};
use crate::error::{Error, Result};
use crate::namespaces::{clone_flags, IdMapAckPipe, IdMapping, NsKind};
use crate::network::NetworkInterface;
use crate::process::channel::Channel;
use crate::process::fork;
use crate::rootfs;
use crate::syscall::create_syscall;
use crate::tty;

/// Marker file the in-zone agent writes before a requested reboot exits
/// with status 0 (§4.12 "Reboot"; path fixed per SPEC_FULL §B.7).
fn reboot_marker_path(work_path: &std::path::Path) -> PathBuf {
    work_path.join("state").join("reboot")
}

/// Runtime-only handles defined iff `state.status != Stopped` (§3.1).
pub struct RuntimeHandles {
    pub guard_pid: Pid,
    pub command_fd: RawFd,
    pub init_sync_fd: RawFd,
}

/// One-byte commands the host sends to the guard over `command_fd` after
/// start completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum GuardCommand {
    Shutdown = 1,
    Destroy = 2,
}

fn socketpair() -> Result<(RawFd, RawFd)> {
    let (a, b) = socket::socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(Error::from)?;
    Ok((a, b))
}

/// `start` (§4.12): STOPPED -> STARTING -> RUNNING, or back to STOPPED on
/// any failure before step 5 (`INIT_EXEC`).
///
/// Returns the pty masters the zone allocated (§4.11), tagged by index, so
/// the caller can register them with its `tty::ConsoleRegistry`.
pub fn start(state: &mut State) -> Result<(RuntimeHandles, Vec<(u32, RawFd)>)> {
    if !state.status.can_start() {
        return Err(Error::InvalidState(format!("cannot start from {:?}", state.status)));
    }
    state.status = ContainerState::Starting;

    let (host_command_fd, guard_command_fd) = socketpair()?;
    let mut host_sync = Channel::new()?; // guard -> host: GuardReady, InitExec, InitExited
    let guard_sync = host_sync.try_clone()?;

    let terminal_count = state.terminal_count;
    let guard_state = state.clone();
    let guard_pid = fork::clone(
        Box::new(move || {
            let mut guard_sync = guard_sync.try_clone().expect("dup guard sync channel");
            match run_guard(&guard_state, guard_command_fd, &mut guard_sync, terminal_count) {
                Ok(code) => code as isize,
                Err(e) => {
                    log::error!("guard exited with error: {}", e);
                    -1
                }
            }
        }),
        nix::sched::CloneFlags::empty(),
    )?;

    unistd::close(guard_command_fd)?;

    let reported_guard_pid = host_sync.wait_for_guard_ready()?;
    if reported_guard_pid != guard_pid {
        return Err(Error::HandshakeFailed {
            step: 1,
            reason: "guard-reported pid does not match clone() pid".into(),
        });
    }

    let mut ptys = Vec::with_capacity(terminal_count as usize);
    for _ in 0..terminal_count {
        let (index, fd) = tty::receive_master(host_command_fd)
            .map_err(|e| Error::HandshakeFailed { step: 4, reason: e.to_string() })?;
        ptys.push((index, fd));
    }

    host_sync
        .wait_for_init_exec()
        .map_err(|e| Error::HandshakeFailed { step: 5, reason: e.to_string() })?;

    state.status = ContainerState::Running;
    state.guard_pid = Some(guard_pid);
    state.command_fd = Some(host_command_fd);
    state.init_sync_fd = Some(host_sync.receiver_fd());

    Ok((
        RuntimeHandles {
            guard_pid,
            command_fd: host_command_fd,
            init_sync_fd: host_sync.receiver_fd(),
        },
        ptys,
    ))
}

/// Runs entirely inside the cloned guard process. Returns init's exit code.
fn run_guard(state: &State, command_fd: RawFd, host_sync: &mut Channel, terminal_count: u32) -> Result<i32> {
    assign_pid_all(&state.cgroup_config, unistd::getpid())?;

    loop {
        host_sync.send_guard_ready(unistd::getpid())?;

        let (pty_guard_fd, pty_init_fd) = socketpair()?;
        let init_sync = Channel::new()?; // init -> guard: NsEntered, Provisioned, InitExec
        let init_sync_for_init = init_sync.try_clone()?;
        let id_map_pipe = IdMapAckPipe::new()?;

        let state_for_init = state.clone();
        let flags = clone_flags(&state.namespaces);
        let init_pid = fork::clone(
            Box::new(move || {
                let mut init_sync = init_sync_for_init.try_clone().expect("dup init sync channel");
                match run_init(&state_for_init, &id_map_pipe, &mut init_sync, pty_init_fd, terminal_count) {
                    Ok(()) => 0,
                    Err(e) => {
                        log::error!("init setup failed: {}", e);
                        -1
                    }
                }
            }),
            flags,
        )?;
        unistd::close(pty_init_fd)?;

        if state.namespaces.contains(&NsKind::User) {
            let uid_mappings: Vec<IdMapping> = state
                .uid_mappings
                .iter()
                .map(|m| IdMapping { inside_id: m.inside_id, outside_id: m.outside_id, length: m.count })
                .collect();
            let gid_mappings: Vec<IdMapping> = state
                .gid_mappings
                .iter()
                .map(|m| IdMapping { inside_id: m.inside_id, outside_id: m.outside_id, length: m.count })
                .collect();
            id_map_pipe.write_id_maps_and_ack(init_pid, &uid_mappings, &gid_mappings)?;
        }

        for cfg in &state.network_config {
            let iface = NetworkInterface::new(cfg.name.clone(), unistd::getpid());
            iface.create(cfg.kind, cfg.peer.as_deref(), cfg.mode)?;
            iface.move_to(init_pid)?;
        }

        init_sync.wait_for_init_ns_entered()?;
        init_sync.wait_for_init_provisioned()?;

        for _ in 0..terminal_count {
            let (index, master) = tty::receive_master(pty_guard_fd)?;
            tty::send_master(command_fd, index, master)?;
            unistd::close(master)?;
        }

        init_sync.wait_for_init_exec()?;
        host_sync.send_init_exec()?;

        let exit_code = guard_wait_loop(init_pid, command_fd)?;

        let marker = reboot_marker_path(&state.work_path);
        if exit_code == 0 && marker.exists() {
            let _ = std::fs::remove_file(&marker);
            log::info!("container {} rebooting, re-entering guard step 1", state.name);
            continue;
        }

        host_sync.send_init_exited()?;
        return Ok(exit_code);
    }
}

/// Blocks until init exits, servicing `Shutdown`/`Destroy` commands from
/// the host on `command_fd` in the meantime (§4.12's shutdown/destroy
/// phases; §5: the guard is single-threaded, so this polls rather than
/// spawning a watcher thread).
fn guard_wait_loop(init_pid: Pid, command_fd: RawFd) -> Result<i32> {
    use nix::poll::{poll, PollFd, PollFlags};

    loop {
        let mut fds = [PollFd::new(command_fd, PollFlags::POLLIN)];
        let n = poll(&mut fds, 200).map_err(Error::from)?;
        if n > 0 {
            let mut buf = [0u8; 1];
            if unistd::read(command_fd, &mut buf).map_err(Error::from)? == 1 {
                match buf[0] {
                    x if x == GuardCommand::Shutdown as u8 => {
                        let _ = signal::kill(init_pid, Signal::SIGTERM);
                    }
                    x if x == GuardCommand::Destroy as u8 => {
                        let _ = signal::kill(init_pid, Signal::SIGKILL);
                    }
                    _ => {}
                }
            }
        }
        match waitpid(init_pid, Some(WaitPidFlag::WNOHANG)).map_err(Error::from)? {
            WaitStatus::Exited(_, code) => return Ok(code),
            WaitStatus::Signaled(_, sig, _) => return Ok(128 + sig as i32),
            _ => continue,
        }
    }
}

/// Runs entirely inside the cloned init process, up to and including
/// `execve` of the user's `init_argv`. On success this function never
/// returns (§4.12 step 5 replaces the process image); on failure it
/// returns an error so `run_guard` can log it before the process exits.
fn run_init(
    state: &State,
    id_map_pipe: &IdMapAckPipe,
    init_sync: &mut Channel,
    pty_fd: RawFd,
    terminal_count: u32,
) -> Result<()> {
    if state.namespaces.contains(&NsKind::User) {
        id_map_pipe.wait_for_maps_written()?;
    }

    let syscall = create_syscall();
    syscall.set_hostname(&state.hostname)?;
    init_sync.send_init_ns_entered()?;

    rootfs::apply(syscall.as_ref(), &state.root_path, &state.provisioning())?;

    std::fs::create_dir_all("/proc").ok();
    syscall.mount(Some(std::path::Path::new("proc")), std::path::Path::new("/proc"), Some("proc"), nix::mount::MsFlags::empty(), None)?;
    std::fs::create_dir_all("/sys").ok();
    syscall.mount(Some(std::path::Path::new("sysfs")), std::path::Path::new("/sys"), Some("sysfs"), nix::mount::MsFlags::empty(), None)?;

    for cfg in &state.network_config {
        let iface = NetworkInterface::new(cfg.name.clone(), Pid::from_raw(0));
        iface.up()?;
        for addr in &cfg.addresses {
            iface.add_inet_addr(addr)?;
        }
        for route in &cfg.routes {
            iface.add_route(route)?;
        }
    }

    let pairs = tty::allocate(terminal_count)?;
    init_sync.send_init_provisioned()?;
    for (index, pair) in pairs.iter().enumerate() {
        tty::send_master(pty_fd, index as u32, pair.master)?;
        unistd::close(pair.master)?;
    }
    if let Some(first) = pairs.first() {
        tty::make_controlling(first.slave)?;
    }

    init_sync.send_init_exec()?;

    let argv: Vec<std::ffi::CString> = state
        .init_argv
        .iter()
        .map(|s| std::ffi::CString::new(s.as_str()).expect("init_argv entries must not contain NUL"))
        .collect();
    let argv_refs: Vec<&std::ffi::CStr> = argv.iter().map(|c| c.as_c_str()).collect();
    unistd::execvp(&argv_refs[0], &argv_refs).map_err(Error::from)?;
    unreachable!("execvp only returns on error, which is mapped above");
}

/// `shutdown` (§4.12): SIGTERM, wait up to `shutdown_timeout_ms`, then
/// escalate to SIGKILL of the whole freezer cgroup.
pub fn shutdown(state: &mut State, handles: &RuntimeHandles, shutdown_timeout_ms: u64) -> Result<()> {
    if !state.status.can_shutdown() {
        return Err(Error::InvalidState(format!("cannot shutdown from {:?}", state.status)));
    }
    state.status = ContainerState::Stopping;
    unistd::write(handles.command_fd, &[GuardCommand::Shutdown as u8]).map_err(Error::from)?;

    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(shutdown_timeout_ms);
    while std::time::Instant::now() < deadline {
        if wait_for_exit(state, handles)?.is_some() {
            return Ok(());
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    kill_freezer_cgroup(state)?;
    wait_for_exit(state, handles)?;
    Ok(())
}

/// `destroy` (§4.12): skips the SIGTERM phase.
pub fn destroy(state: &mut State, handles: &RuntimeHandles) -> Result<()> {
    if !state.status.can_destroy() {
        return Err(Error::InvalidState(format!("cannot destroy from {:?}", state.status)));
    }
    state.status = ContainerState::Stopping;
    unistd::write(handles.command_fd, &[GuardCommand::Destroy as u8]).map_err(Error::from)?;
    kill_freezer_cgroup(state)?;
    wait_for_exit(state, handles)?;
    Ok(())
}

fn kill_freezer_cgroup(state: &State) -> Result<()> {
    if let Some(spec) = state
        .cgroup_config
        .cgroups
        .iter()
        .find(|c| c.subsystem == Subsystem::Freezer)
    {
        let cg = CGroup::new(Subsystem::Freezer, spec.name.clone())?;
        for pid in cg.pids().unwrap_or_default() {
            let _ = signal::kill(pid, Signal::SIGKILL);
        }
    }
    Ok(())
}

/// Non-blocking check for `INIT_EXITED` (step 6): `Some(status)` once the
/// guard has reaped init and reported it; `None` while still running.
/// Transitions `state` to `Stopped` and releases the runtime handles.
pub fn wait_for_exit(state: &mut State, handles: &RuntimeHandles) -> Result<Option<i32>> {
    match waitpid(handles.guard_pid, Some(WaitPidFlag::WNOHANG)).map_err(Error::from)? {
        WaitStatus::StillAlive => Ok(None),
        WaitStatus::Exited(_, code) => {
            finish_stop(state, handles)?;
            Ok(Some(code))
        }
        WaitStatus::Signaled(_, sig, _) => {
            finish_stop(state, handles)?;
            Ok(Some(128 + sig as i32))
        }
        _ => Ok(None),
    }
}

fn finish_stop(state: &mut State, handles: &RuntimeHandles) -> Result<()> {
    let _ = unistd::close(handles.command_fd);
    let _ = unistd::close(handles.init_sync_fd);
    state.status = ContainerState::Stopped;
    state.init_pid = None;
    state.guard_pid = None;
    state.command_fd = None;
    state.init_sync_fd = None;
    Ok(())
}

/// `freeze` (§4.12): writes `FROZEN` to `freezer.state`. Purely a
/// host-side cgroup write — no guard involvement, since the freezer
/// controller is already attached to every task in the group (§4.8).
pub fn freeze(state: &mut State) -> Result<()> {
    if !state.status.can_freeze() {
        return Err(Error::InvalidState(format!("cannot freeze from {:?}", state.status)));
    }
    set_freezer_state(state, "FROZEN")?;
    state.status = ContainerState::Paused;
    Ok(())
}

/// `thaw` (§4.12): writes `THAWED` to `freezer.state`.
pub fn thaw(state: &mut State) -> Result<()> {
    if !state.status.can_thaw() {
        return Err(Error::InvalidState(format!("cannot thaw from {:?}", state.status)));
    }
    set_freezer_state(state, "THAWED")?;
    state.status = ContainerState::Running;
    Ok(())
}

fn set_freezer_state(state: &State, value: &str) -> Result<()> {
    let spec = state
        .cgroup_config
        .cgroups
        .iter()
        .find(|c| c.subsystem == Subsystem::Freezer)
        .ok_or_else(|| Error::NotSupported("no freezer cgroup configured".into()))?;
    let cg = CGroup::new(Subsystem::Freezer, spec.name.clone())?;
    cg.set_common("state", value)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample() -> State {
        State::new("zone-a", PathBuf::from("/var/lib/vasum/zone-a"), PathBuf::from("/run/vasum/zone-a"), vec!["/sbin/init".into()])
    }

    #[test]
    fn start_is_rejected_unless_stopped() {
        let mut state = sample();
        state.status = ContainerState::Running;
        assert!(start(&mut state).is_err());
    }

    #[test]
    fn freeze_requires_a_configured_freezer_cgroup() {
        let mut state = sample();
        state.status = ContainerState::Running;
        assert!(freeze(&mut state).is_err());
    }

    #[test]
    fn reboot_marker_path_is_under_state_dir() {
        let path = reboot_marker_path(&PathBuf::from("/run/vasum/zone-a"));
        assert_eq!(path, PathBuf::from("/run/vasum/zone-a/state/reboot"));
    }
}
