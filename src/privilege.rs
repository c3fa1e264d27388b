//! Privilege boundary (C8, spec.md §6/§9). Explicitly out of scope for
//! deep design per spec.md §1 ("daemonization, chroot/privilege drop...
//! specified only at their interfaces"); this is a thin shim that still
//! has to work, since the CLI surface (`-P`, `-C`, `-c`) exercises it.

use std::path::Path;

use crate::error::PrivilegeError;

/// Historical `nobody`/`nogroup` ids used by the original daemon.
pub const NOBODY_UID: libc::uid_t = 65534;
pub const NOGROUP_GID: libc::gid_t = 65534;

pub fn running_as_root() -> bool {
    // SAFETY: geteuid() takes no arguments and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

pub fn write_pid_file(path: &Path) -> Result<(), PrivilegeError> {
    std::fs::write(path, std::process::id().to_string()).map_err(|source| PrivilegeError::PidFile {
        path: path.to_path_buf(),
        source,
    })
}

/// `chroot(2)` into `dir`, `chdir("/")`, then drop to `nobody:nogroup`.
/// Group must be dropped before user, since dropping the user first
/// would remove the privilege needed to change the group.
pub fn chroot_and_drop(dir: &Path) -> Result<(), PrivilegeError> {
    let c_path = std::ffi::CString::new(dir.as_os_str().as_encoded_bytes())
        .map_err(|e| PrivilegeError::Chroot {
            path: dir.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        })?;

    // SAFETY: c_path is a valid, nul-terminated C string for the lifetime
    // of this call, and chroot/chdir/setgid/setuid are simple syscalls
    // with no further preconditions beyond the arguments passed.
    unsafe {
        if libc::chroot(c_path.as_ptr()) != 0 {
            return Err(PrivilegeError::Chroot {
                path: dir.to_path_buf(),
                source: std::io::Error::last_os_error(),
            });
        }

        let root = std::ffi::CString::new("/").expect("no interior nul");
        if libc::chdir(root.as_ptr()) != 0 {
            return Err(PrivilegeError::Chroot {
                path: dir.to_path_buf(),
                source: std::io::Error::last_os_error(),
            });
        }

        if libc::setgid(NOGROUP_GID) != 0 {
            return Err(PrivilegeError::Drop(std::io::Error::last_os_error()));
        }

        if libc::setuid(NOBODY_UID) != 0 {
            return Err(PrivilegeError::Drop(std::io::Error::last_os_error()));
        }
    }

    Ok(())
}
