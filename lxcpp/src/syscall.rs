//! An interface trait so the rest of lxcpp can call kernel primitives
//! without worrying about their implementation details, and so tests can
//! substitute a recording fake — the same shape as the teacher's
//! `src/syscall/{syscall,linux,test}.rs`.

use std::any::Any;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;

use caps::{errors::CapsError, CapSet, CapsHashSet};
use nix::mount::MsFlags;
use nix::sched::CloneFlags;
use nix::unistd::{Gid, Uid};

use crate::error::Result;

pub trait Syscall {
    fn as_any(&self) -> &dyn Any;
    fn pivot_rootfs(&self, path: &Path) -> Result<()>;
    fn set_ns(&self, rawfd: i32, nstype: CloneFlags) -> Result<()>;
    fn set_id(&self, uid: Uid, gid: Gid) -> Result<()>;
    fn unshare(&self, flags: CloneFlags) -> Result<()>;
    fn set_capability(&self, cset: CapSet, value: &CapsHashSet) -> std::result::Result<(), CapsError>;
    fn set_hostname(&self, hostname: &str) -> Result<()>;
    fn get_pwuid(&self, uid: u32) -> Option<Arc<OsStr>>;
    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()>;
    fn mknod(&self, path: &Path, kind: nix::sys::stat::SFlag, mode: nix::sys::stat::Mode, dev: u64) -> Result<()>;
}

pub fn create_syscall() -> Box<dyn Syscall> {
    if cfg!(test) {
        Box::new(test::TestHelperSyscall::default())
    } else {
        Box::new(linux::LinuxSyscall)
    }
}

pub mod linux {
    use super::*;
    use nix::unistd::{fchdir, pivot_root, sethostname};
    use nix::fcntl::{open, OFlag};
    use nix::mount::{mount as nix_mount, umount2, MntFlags};
    use nix::sys::stat::{mknod, Mode, SFlag};
    use nix::unistd;

    #[derive(Clone)]
    pub struct LinuxSyscall;

    impl Syscall for LinuxSyscall {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn pivot_rootfs(&self, path: &Path) -> Result<()> {
            let newroot = open(path, OFlag::O_DIRECTORY | OFlag::O_RDONLY, Mode::empty())?;
            pivot_root(path, path)?;
            umount2("/", MntFlags::MNT_DETACH)?;
            fchdir(newroot)?;
            unistd::close(newroot)?;
            Ok(())
        }

        fn set_ns(&self, rawfd: i32, nstype: CloneFlags) -> Result<()> {
            nix::sched::setns(rawfd, nstype)?;
            Ok(())
        }

        fn set_id(&self, uid: Uid, gid: Gid) -> Result<()> {
            prctl::set_keep_capabilities(true)
                .map_err(|e| crate::error::Error::PermissionDenied(format!("keep caps: {}", e)))?;
            unistd::setresgid(gid, gid, gid)?;
            unistd::setresuid(uid, uid, uid)?;
            if uid != Uid::from_raw(0) {
                reset_effective(self)?;
            }
            prctl::set_keep_capabilities(false)
                .map_err(|e| crate::error::Error::PermissionDenied(format!("keep caps: {}", e)))?;
            Ok(())
        }

        fn unshare(&self, flags: CloneFlags) -> Result<()> {
            nix::sched::unshare(flags)?;
            Ok(())
        }

        fn set_capability(&self, cset: CapSet, value: &CapsHashSet) -> std::result::Result<(), CapsError> {
            match cset {
                CapSet::Bounding => {
                    for c in caps::all().difference(value) {
                        caps::drop(None, CapSet::Bounding, *c)?;
                    }
                    Ok(())
                }
                _ => caps::set(None, cset, value),
            }
        }

        fn set_hostname(&self, hostname: &str) -> Result<()> {
            sethostname(hostname)?;
            Ok(())
        }

        fn get_pwuid(&self, uid: u32) -> Option<Arc<OsStr>> {
            use std::ffi::CStr;
            use std::os::unix::ffi::OsStrExt;
            unsafe {
                let mut buf = vec![0_i8; 16384];
                let mut result: *mut libc::passwd = std::ptr::null_mut();
                let mut pwd: libc::passwd = std::mem::zeroed();
                let rc = libc::getpwuid_r(
                    uid,
                    &mut pwd,
                    buf.as_mut_ptr(),
                    buf.len(),
                    &mut result,
                );
                if rc != 0 || result.is_null() {
                    return None;
                }
                let name = CStr::from_ptr(pwd.pw_name);
                Some(Arc::from(OsStr::from_bytes(name.to_bytes())))
            }
        }

        fn mount(
            &self,
            source: Option<&Path>,
            target: &Path,
            fstype: Option<&str>,
            flags: MsFlags,
            data: Option<&str>,
        ) -> Result<()> {
            nix_mount(source, target, fstype, flags, data)?;
            Ok(())
        }

        fn mknod(&self, path: &Path, kind: SFlag, mode: Mode, dev: u64) -> Result<()> {
            mknod(path, kind, mode, dev)?;
            Ok(())
        }
    }

    /// Drop capabilities to the effective set, used after `setresuid` to a
    /// non-root uid (mirrors the teacher's `capabilities::reset_effective`).
    fn reset_effective(syscall: &dyn Syscall) -> Result<()> {
        let mut empty = CapsHashSet::new();
        empty.clear();
        syscall
            .set_capability(CapSet::Effective, &empty)
            .map_err(|e| crate::error::Error::PermissionDenied(e.to_string()))
    }
}

pub mod test {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct TestHelperSyscall {
        pub setns_args: Mutex<Vec<(i32, CloneFlags)>>,
        pub unshare_args: Mutex<Vec<CloneFlags>>,
        pub mount_args: Mutex<Vec<(Option<std::path::PathBuf>, std::path::PathBuf)>>,
    }

    impl Syscall for TestHelperSyscall {
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn pivot_rootfs(&self, _path: &Path) -> Result<()> {
            Ok(())
        }
        fn set_ns(&self, rawfd: i32, nstype: CloneFlags) -> Result<()> {
            self.setns_args.lock().unwrap().push((rawfd, nstype));
            Ok(())
        }
        fn set_id(&self, _uid: Uid, _gid: Gid) -> Result<()> {
            Ok(())
        }
        fn unshare(&self, flags: CloneFlags) -> Result<()> {
            self.unshare_args.lock().unwrap().push(flags);
            Ok(())
        }
        fn set_capability(&self, _cset: CapSet, _value: &CapsHashSet) -> std::result::Result<(), CapsError> {
            Ok(())
        }
        fn set_hostname(&self, _hostname: &str) -> Result<()> {
            Ok(())
        }
        fn get_pwuid(&self, _uid: u32) -> Option<Arc<OsStr>> {
            None
        }
        fn mount(
            &self,
            source: Option<&Path>,
            target: &Path,
            _fstype: Option<&str>,
            _flags: MsFlags,
            _data: Option<&str>,
        ) -> Result<()> {
            self.mount_args
                .lock()
                .unwrap()
                .push((source.map(|p| p.to_path_buf()), target.to_path_buf()));
            Ok(())
        }
        fn mknod(&self, _path: &Path, _kind: nix::sys::stat::SFlag, _mode: nix::sys::stat::Mode, _dev: u64) -> Result<()> {
            Ok(())
        }
    }

    impl TestHelperSyscall {
        pub fn get_setns_args(&self) -> Vec<(i32, CloneFlags)> {
            self.setns_args.lock().unwrap().clone()
        }
        pub fn get_unshare_args(&self) -> Vec<CloneFlags> {
            self.unshare_args.lock().unwrap().clone()
        }
    }
}
