use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex, MutexGuard};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use waycore_server::{Display, ListeningSocket, SocketError};

// the tests of this file mutate XDG_RUNTIME_DIR, serialize them
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn scratch_runtime_dir() -> (MutexGuard<'static, ()>, tempfile::TempDir) {
    let guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("XDG_RUNTIME_DIR", dir.path());
    (guard, dir)
}

fn is_cloexec(fd: std::os::unix::io::RawFd) -> bool {
    let flags = fcntl(fd, FcntlArg::F_GETFD).unwrap();
    FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC)
}

#[test]
fn auto_binding_takes_successive_names() {
    let (_guard, dir) = scratch_runtime_dir();

    let first = ListeningSocket::bind_auto().unwrap();
    let second = ListeningSocket::bind_auto().unwrap();
    assert_eq!(first.display_name(), "wayland-0");
    assert_eq!(second.display_name(), "wayland-1");

    // socket and lock files both exist while the sockets live
    assert!(dir.path().join("wayland-0").exists());
    assert!(dir.path().join("wayland-0.lock").exists());
    assert!(dir.path().join("wayland-1").exists());

    // on destruction both paths are unlinked
    let socket_path = first.socket_path().to_owned();
    drop(first);
    assert!(!socket_path.exists());
    assert!(!dir.path().join("wayland-0.lock").exists());
    assert!(dir.path().join("wayland-1").exists());
}

#[test]
fn the_lock_is_mandatory() {
    let (_guard, _dir) = scratch_runtime_dir();

    let held = ListeningSocket::bind("wayland-7").unwrap();
    match ListeningSocket::bind("wayland-7") {
        Err(SocketError::AlreadyInUse) => {}
        other => panic!("expected AlreadyInUse, got {:?}", other.map(|_| ())),
    }
    drop(held);
    // the name is usable again once the lock is released
    ListeningSocket::bind("wayland-7").unwrap();
}

#[test]
fn stale_socket_files_are_replaced() {
    let (_guard, dir) = scratch_runtime_dir();

    {
        let _socket = ListeningSocket::bind("wayland-3").unwrap();
    }
    // simulate a crashed server: socket file left behind, lock free
    std::fs::write(dir.path().join("wayland-3"), b"").unwrap();
    let socket = ListeningSocket::bind("wayland-3").unwrap();
    assert_eq!(socket.display_name(), "wayland-3");
}

#[test]
fn missing_runtime_dir_is_an_error() {
    let guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    std::env::remove_var("XDG_RUNTIME_DIR");
    match ListeningSocket::bind("wayland-0") {
        Err(e @ SocketError::RuntimeDirNotSet) => {
            assert_eq!(e.as_errno(), Some(nix::errno::Errno::ENOENT));
        }
        other => panic!("expected RuntimeDirNotSet, got {:?}", other.map(|_| ())),
    }
    drop(guard);
}

#[test]
fn over_long_names_are_rejected() {
    let (_guard, _dir) = scratch_runtime_dir();
    let name = "x".repeat(200);
    match ListeningSocket::bind(&name) {
        Err(e @ SocketError::NameTooLong) => {
            assert_eq!(e.as_errno(), Some(nix::errno::Errno::ENAMETOOLONG));
        }
        other => panic!("expected NameTooLong, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn accepted_connections_are_cloexec() {
    let (_guard, _dir) = scratch_runtime_dir();

    let socket = ListeningSocket::bind("wayland-9").unwrap();
    assert!(is_cloexec(socket.as_raw_fd()));

    let connecting = UnixStream::connect(socket.socket_path()).unwrap();
    let accepted = socket.accept().unwrap().expect("no pending connection");
    assert!(is_cloexec(accepted.as_raw_fd()));
    drop(connecting);
}

#[test]
fn accepted_stream_becomes_a_client() {
    let (_guard, _dir) = scratch_runtime_dir();

    let socket = ListeningSocket::bind("wayland-11").unwrap();
    let _connecting = UnixStream::connect(socket.socket_path()).unwrap();
    let stream = socket.accept().unwrap().expect("no pending connection");

    let display: Display<()> = Display::new();
    let client_id = display.insert_client(stream, Arc::new(())).unwrap();
    let credentials = display.handle().get_client_credentials(&client_id).unwrap();
    assert_eq!(credentials.pid, std::process::id() as i32);
    // we own the socket file we just bound
    use std::os::unix::fs::MetadataExt;
    let our_uid = std::fs::metadata(socket.socket_path()).unwrap().uid();
    assert_eq!(credentials.uid, our_uid);
}

#[test]
fn duplicated_fds_are_cloexec() {
    let file = tempfile::tempfile().unwrap();
    let dup = waycore_protocol::wire::dup_fd_cloexec(file.as_raw_fd()).unwrap();
    assert!(is_cloexec(dup.as_raw_fd()));
    assert_ne!(dup.as_raw_fd(), file.as_raw_fd());
}
