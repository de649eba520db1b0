//! Listening unix sockets, with their companion lockfiles.
//!
//! A socket lives at `${XDG_RUNTIME_DIR}/<name>` and is guarded by an
//! exclusive advisory lock on `<name>.lock`, held for the socket's
//! whole lifetime. The lock is what arbitrates concurrent servers: a
//! stale socket file left behind by a dead server is detected by its
//! lock being free, and removed.

use std::env;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io::{ErrorKind, Result as IoResult};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{flock, open, FlockArg, OFlag};
use nix::sys::socket::{self, SockFlag, UnixAddr};
use nix::sys::stat::Mode;

// sizeof(sockaddr_un.sun_path); a socket path longer than this,
// including the NUL terminator, cannot be bound
const SUN_PATH_MAX: usize = 108;

const LOCK_SUFFIX: &str = ".lock";

/// Error while setting up a listening socket.
#[derive(Debug)]
pub enum SocketError {
    /// `XDG_RUNTIME_DIR` is not set in the environment (`ENOENT`).
    RuntimeDirNotSet,
    /// The socket path does not fit in a socket address
    /// (`ENAMETOOLONG`).
    NameTooLong,
    /// The name is already taken by a live server holding its lock.
    AlreadyInUse,
    /// Any other I/O failure.
    Io(std::io::Error),
}

impl std::error::Error for SocketError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RuntimeDirNotSet => f.write_str("XDG_RUNTIME_DIR is not set in the environment"),
            Self::NameTooLong => f.write_str("socket path exceeds the maximum socket address size"),
            Self::AlreadyInUse => f.write_str("the socket name is locked by another server"),
            Self::Io(e) => write!(f, "{}", e),
        }
    }
}

impl From<std::io::Error> for SocketError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<Errno> for SocketError {
    fn from(e: Errno) -> Self {
        Self::Io(e.into())
    }
}

impl SocketError {
    /// The errno equivalent of this error, when there is one.
    pub fn as_errno(&self) -> Option<Errno> {
        match self {
            Self::RuntimeDirNotSet => Some(Errno::ENOENT),
            Self::NameTooLong => Some(Errno::ENAMETOOLONG),
            _ => None,
        }
    }
}

/// A bound listening socket with its held lockfile.
///
/// Dropping it unlinks both the socket path and the lock path.
#[derive(Debug)]
pub struct ListeningSocket {
    listener: UnixListener,
    _lock: OwnedFd,
    socket_path: PathBuf,
    lock_path: PathBuf,
    display_name: OsString,
}

impl ListeningSocket {
    /// Bind the socket for a display name.
    ///
    /// A relative name is joined under `XDG_RUNTIME_DIR`; an absolute
    /// one is used as given.
    pub fn bind<S: AsRef<OsStr>>(name: S) -> Result<Self, SocketError> {
        let name = name.as_ref();
        let socket_path = socket_path_for(name)?;

        // the lock is taken before touching the socket path
        let lock_path = with_lock_suffix(&socket_path);
        let lock = match open(
            &lock_path,
            OFlag::O_CREAT | OFlag::O_CLOEXEC | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IWGRP,
        ) {
            Ok(fd) => unsafe { OwnedFd::from_raw_fd(fd) },
            Err(e) => {
                log::warn!("unable to open lockfile {:?}, check permissions", lock_path);
                return Err(e.into());
            }
        };
        if flock(lock.as_raw_fd(), FlockArg::LockExclusiveNonblock).is_err() {
            log::warn!(
                "unable to lock lockfile {:?}, maybe another server is running",
                lock_path
            );
            return Err(SocketError::AlreadyInUse);
        }

        // with the lock held, a leftover socket file is stale and can
        // be removed, as long as it looks like one we would have
        // created
        match fs::metadata(&socket_path) {
            Ok(meta) => {
                if meta.permissions().mode() & 0o220 != 0 {
                    let _ = fs::remove_file(&socket_path);
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = bind_listener(&socket_path)?;

        log::debug!("listening on {:?}", socket_path);

        Ok(Self { listener, _lock: lock, socket_path, lock_path, display_name: name.to_owned() })
    }

    /// Bind the default socket: `$WAYLAND_DISPLAY`, falling back to
    /// `wayland-0`.
    pub fn bind_default() -> Result<Self, SocketError> {
        match env::var_os("WAYLAND_DISPLAY") {
            Some(name) => Self::bind(name),
            None => Self::bind("wayland-0"),
        }
    }

    /// Bind the first available display name among `wayland-0` …
    /// `wayland-32`.
    ///
    /// Names whose lock is already taken are skipped.
    pub fn bind_auto() -> Result<Self, SocketError> {
        for displayno in 0..=32 {
            match Self::bind(format!("wayland-{}", displayno)) {
                Ok(socket) => return Ok(socket),
                Err(SocketError::AlreadyInUse) => continue,
                Err(e) => return Err(e),
            }
        }
        // ran out of display names
        Err(SocketError::AlreadyInUse)
    }

    /// Accept a pending connection, if any.
    ///
    /// The returned stream is close-on-exec. Returns `None` when no
    /// connection is pending.
    pub fn accept(&self) -> IoResult<Option<UnixStream>> {
        match self.listener.accept() {
            Ok((stream, _)) => Ok(Some(stream)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The display name this socket was bound for.
    pub fn display_name(&self) -> &OsStr {
        &self.display_name
    }

    /// The filesystem path of the socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl AsRawFd for ListeningSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

impl Drop for ListeningSocket {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.socket_path);
        let _ = fs::remove_file(&self.lock_path);
    }
}

fn socket_path_for(name: &OsStr) -> Result<PathBuf, SocketError> {
    let runtime_dir = match env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => {
            log::warn!("XDG_RUNTIME_DIR not set in the environment");
            return Err(SocketError::RuntimeDirNotSet);
        }
    };

    let name_path: &Path = name.as_ref();
    let path = if name_path.is_absolute() { name_path.to_owned() } else { runtime_dir.join(name) };

    // including the NUL terminator
    if path.as_os_str().as_bytes().len() + 1 > SUN_PATH_MAX {
        log::warn!("socket path {:?} plus NUL terminator exceeds {} bytes", path, SUN_PATH_MAX);
        return Err(SocketError::NameTooLong);
    }

    Ok(path)
}

fn with_lock_suffix(path: &Path) -> PathBuf {
    let mut lock_path = path.as_os_str().to_owned();
    lock_path.push(LOCK_SUFFIX);
    PathBuf::from(lock_path)
}

// socket() + bind() + listen(), close-on-exec from birth
fn bind_listener(path: &Path) -> Result<UnixListener, SocketError> {
    let fd = socket::socket(
        socket::AddressFamily::Unix,
        socket::SockType::Stream,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        None,
    )?;
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    let addr = UnixAddr::new(path).map_err(SocketError::from)?;
    socket::bind(fd.as_raw_fd(), &addr)?;
    socket::listen(fd.as_raw_fd(), 1)?;
    Ok(unsafe { UnixListener::from_raw_fd(std::os::unix::io::IntoRawFd::into_raw_fd(fd)) })
}
