//! Root switch and provisioning (§4.10, C10), applied by the guard after
//! namespace entry and before `execve` of init.
//!
//! Grounded on the teacher's `src/rootfs/{rootfs,mount,symlink,utils}.rs`:
//! the private-propagation + bind-mount-self + `pivot_root` sequence is the
//! same shape as `RootFS::prepare_rootfs`/`make_parent_mount_private`, routed
//! here through the `Syscall` trait's `pivot_rootfs` (`syscall.rs`, itself
//! adapted from `src/syscall/linux.rs::pivot_rootfs`) instead of OCI mount
//! entries. The per-declaration mount/link/file provisioning replaces the
//! teacher's OCI `Mount` list with vasum's own §6.3 schema.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use nix::sys::stat::{Mode, SFlag};
use serde::{Deserialize, Serialize};

use crate::container::MountDeclaration;
use crate::error::{Error, Result};
use crate::syscall::Syscall;

/// §4.10 step 4: a hard link from a source path to a target path, both
/// already relative to the new root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkProvision {
    pub source: PathBuf,
    pub target: PathBuf,
}

/// §4.10 step 5 `kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    Dir,
    Reg,
    Fifo,
    Sock,
    Dev,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileProvision {
    pub kind: FileKind,
    pub path: PathBuf,
    pub mode: u32,
    /// Only meaningful for `FileKind::Dev`.
    pub major: Option<u64>,
    pub minor: Option<u64>,
}

/// All provisioning declarations for one container (§4.10).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provisioning {
    pub mounts: Vec<MountDeclaration>,
    pub links: Vec<LinkProvision>,
    pub files: Vec<FileProvision>,
}

/// Runs the full §4.10 sequence: private propagation, bind-mount-self,
/// pivot_root, then every declared mount/link/file. Failure at any step
/// aborts (§4.10: "Failure at any step aborts the start sequence").
pub fn apply(syscall: &dyn Syscall, root_path: &Path, provisioning: &Provisioning) -> Result<()> {
    make_propagation_private(syscall)?;
    bind_mount_self(syscall, root_path)?;
    syscall.pivot_rootfs(root_path)?;

    for mount in &provisioning.mounts {
        apply_mount(syscall, mount)?;
    }
    for link in &provisioning.links {
        apply_link(link)?;
    }
    for file in &provisioning.files {
        apply_file(syscall, file)?;
    }
    Ok(())
}

/// §4.10 step 1: "Make the mount propagation of the new mount namespace private."
fn make_propagation_private(syscall: &dyn Syscall) -> Result<()> {
    syscall.mount(None, Path::new("/"), None, MsFlags::MS_REC | MsFlags::MS_PRIVATE, None)
}

/// §4.10 step 2a: "Bind-mount root_path onto itself (required so pivot_root
/// will accept it)".
fn bind_mount_self(syscall: &dyn Syscall, root_path: &Path) -> Result<()> {
    syscall.mount(
        Some(root_path),
        root_path,
        None,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None,
    )
}

/// §4.10 step 3: mount a single declaration, creating the target directory
/// with the declared mode if missing.
fn apply_mount(syscall: &dyn Syscall, decl: &MountDeclaration) -> Result<()> {
    if !decl.target.exists() {
        fs::create_dir_all(&decl.target).map_err(Error::Io)?;
        fs::set_permissions(&decl.target, fs::Permissions::from_mode(decl.mode)).map_err(Error::Io)?;
    }
    syscall.mount(
        decl.source.as_deref(),
        &decl.target,
        decl.fstype.as_deref(),
        MsFlags::from_bits_truncate(decl.flags),
        decl.data.as_deref(),
    )
}

/// §4.10 step 4: hard-link `source` to `target`, copying Smack security
/// labels where the filesystem supports the `security.SMACK64` xattr
/// (teacher's `rootfs/symlink.rs` performs the analogous label-preserving
/// copy for its own default symlinks).
fn apply_link(link: &LinkProvision) -> Result<()> {
    if let Some(parent) = link.target.parent() {
        fs::create_dir_all(parent).map_err(Error::Io)?;
    }
    fs::hard_link(&link.source, &link.target).map_err(Error::Io)?;
    if let Ok(label) = xattr_get(&link.source, "security.SMACK64") {
        let _ = xattr_set(&link.target, "security.SMACK64", &label);
    }
    Ok(())
}

/// §4.10 step 5: create the declared object.
fn apply_file(syscall: &dyn Syscall, file: &FileProvision) -> Result<()> {
    if let Some(parent) = file.path.parent() {
        fs::create_dir_all(parent).map_err(Error::Io)?;
    }
    let mode = Mode::from_bits_truncate(file.mode);
    match file.kind {
        FileKind::Dir => {
            fs::create_dir_all(&file.path).map_err(Error::Io)?;
            fs::set_permissions(&file.path, fs::Permissions::from_mode(file.mode)).map_err(Error::Io)?;
        }
        FileKind::Reg => {
            let f = fs::File::create(&file.path).map_err(Error::Io)?;
            f.set_permissions(fs::Permissions::from_mode(file.mode)).map_err(Error::Io)?;
        }
        FileKind::Fifo => syscall.mknod(&file.path, SFlag::S_IFIFO, mode, 0)?,
        FileKind::Sock => syscall.mknod(&file.path, SFlag::S_IFSOCK, mode, 0)?,
        FileKind::Dev => {
            let major = file.major.unwrap_or(0);
            let minor = file.minor.unwrap_or(0);
            let dev = nix::sys::stat::makedev(major, minor);
            syscall.mknod(&file.path, SFlag::S_IFCHR, mode, dev)?;
        }
    }
    Ok(())
}

fn xattr_get(path: &Path, name: &str) -> std::io::Result<Vec<u8>> {
    let c_path = std::ffi::CString::new(path.as_os_str().to_string_lossy().as_bytes())?;
    let c_name = std::ffi::CString::new(name)?;
    let mut buf = vec![0u8; 256];
    let ret = unsafe {
        libc::getxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    buf.truncate(ret as usize);
    Ok(buf)
}

fn xattr_set(path: &Path, name: &str, value: &[u8]) -> std::io::Result<()> {
    let c_path = std::ffi::CString::new(path.as_os_str().to_string_lossy().as_bytes())?;
    let c_name = std::ffi::CString::new(name)?;
    let ret = unsafe {
        libc::setxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            0,
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestHelperSyscall;
    use tempfile::tempdir;

    #[test]
    fn mount_provision_creates_missing_target_with_declared_mode() {
        let syscall = TestHelperSyscall::default();
        let dir = tempdir().unwrap();
        let target = dir.path().join("proc");
        let decl = MountDeclaration {
            source: None,
            target: target.clone(),
            fstype: Some("proc".into()),
            flags: 0,
            data: None,
            mode: 0o755,
        };
        apply_mount(&syscall, &decl).unwrap();
        assert!(target.is_dir());
        let calls = syscall.mount_args.lock().unwrap();
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn file_provision_creates_a_regular_file() {
        let syscall = TestHelperSyscall::default();
        let dir = tempdir().unwrap();
        let path = dir.path().join("marker");
        let provision = FileProvision {
            kind: FileKind::Reg,
            path: path.clone(),
            mode: 0o644,
            major: None,
            minor: None,
        };
        apply_file(&syscall, &provision).unwrap();
        assert!(path.is_file());
    }

    #[test]
    fn link_provision_hard_links_source_to_target() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("src");
        fs::write(&source, b"hi").unwrap();
        let target = dir.path().join("nested/dst");
        let provision = LinkProvision {
            source: source.clone(),
            target: target.clone(),
        };
        apply_link(&provision).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"hi");
    }
}
