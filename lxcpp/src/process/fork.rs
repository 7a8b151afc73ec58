//! `clone(2)` wrapper used to enter namespaces directly during process
//! creation instead of `fork` + `unshare`. Taken near-verbatim from the
//! teacher's `src/process/fork.rs`, which already solved the guard-page
//! stack allocation; only the error type changed.

use libc::{c_int, c_void};
use nix::errno::Errno;
use nix::sched::{self, CloneFlags};
use nix::sys::mman;
use nix::unistd::Pid;
use std::mem;
use std::ptr;

use crate::error::Result;

pub fn clone(mut cb: sched::CloneCb, clone_flags: CloneFlags) -> Result<Pid> {
    extern "C" fn callback(data: *mut sched::CloneCb) -> c_int {
        let cb: &mut sched::CloneCb = unsafe { &mut *data };
        (*cb)() as c_int
    }

    let page_size: usize = unsafe {
        match libc::sysconf(libc::_SC_PAGE_SIZE) {
            -1 => 4 * 1024,
            x => x as usize,
        }
    };

    let mut rlimit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    unsafe { Errno::result(libc::getrlimit(libc::RLIMIT_STACK, &mut rlimit))? };
    let default_stack_size = rlimit.rlim_cur as usize;

    let child_stack = unsafe {
        mman::mmap(
            ptr::null_mut(),
            default_stack_size,
            mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
            mman::MapFlags::MAP_PRIVATE | mman::MapFlags::MAP_ANONYMOUS | mman::MapFlags::MAP_STACK,
            -1,
            0,
        )?
    };

    let signal = nix::sys::signal::Signal::SIGCHLD;
    let combined = clone_flags.bits() | signal as c_int;
    let res = unsafe {
        // Child stack grows downward; guard the low page against collision.
        mman::mprotect(child_stack, page_size, mman::ProtFlags::PROT_NONE)?;
        let child_stack_top = child_stack.add(default_stack_size);
        libc::clone(
            mem::transmute(callback as extern "C" fn(*mut Box<dyn FnMut() -> isize>) -> i32),
            child_stack_top,
            combined,
            &mut cb as *mut _ as *mut c_void,
        )
    };
    let pid = Errno::result(res).map(Pid::from_raw)?;
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd;

    #[test]
    fn clone_enters_new_pid_namespace_as_pid_1() {
        let flags = CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWUSER;
        let pid = clone(
            Box::new(|| {
                if unistd::getpid() != Pid::from_raw(1) {
                    return -1;
                }
                0
            }),
            flags,
        )
        .unwrap();

        let status = waitpid(pid, None).unwrap();
        assert!(matches!(status, WaitStatus::Exited(_, 0)));
    }

    #[test]
    fn clone_allocates_a_usable_stack() {
        let pid = clone(
            Box::new(|| {
                let mut array_on_stack = [0u8; 4096];
                array_on_stack.iter_mut().for_each(|x| *x = 0);
                0
            }),
            CloneFlags::empty(),
        )
        .unwrap();

        let status = waitpid(pid, None).unwrap();
        assert!(matches!(status, WaitStatus::Exited(_, 0)));
    }
}
