//! Debugging helpers handling the `WAYLAND_DEBUG` env variable.

use std::{
    fmt::Display,
    os::unix::io::AsRawFd,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::protocol::Argument;

/// Whether `WAYLAND_DEBUG` asks for server-side wire tracing.
///
/// Sampled once at display creation; the value is any string
/// containing `1` or `server`.
pub fn has_debug_server_env() -> bool {
    matches!(
        std::env::var("WAYLAND_DEBUG"),
        Ok(var) if var.contains('1') || var.contains("server")
    )
}

/// Print a dispatched message to stderr in the following format:
///
/// `[timestamp] <- interface@id.msg_name(args)`
pub fn print_dispatched_message<Id: Display, Fd: AsRawFd>(
    interface: &str,
    id: u32,
    msg_name: &str,
    args: &[Argument<Id, Fd>],
) {
    print_timestamp();
    eprintln!(" <- {}@{}.{}({})", interface, id, msg_name, DisplaySlice(args));
}

/// Print an outgoing message to stderr in the following format:
///
/// `[timestamp] -> interface@id.msg_name(args)`
pub fn print_send_message<Id: Display, Fd: AsRawFd>(
    interface: &str,
    id: u32,
    msg_name: &str,
    args: &[Argument<Id, Fd>],
) {
    print_timestamp();
    eprintln!(" -> {}@{}.{}({})", interface, id, msg_name, DisplaySlice(args));
}

struct DisplaySlice<'a, D>(pub &'a [D]);

impl<D: Display> Display for DisplaySlice<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut it = self.0.iter();
        if let Some(val) = it.next() {
            write!(f, "{val}")?;
        }
        for val in it {
            write!(f, ", {val}")?;
        }
        Ok(())
    }
}

// seconds.milliseconds, the same format the reference implementation
// traces in
fn print_timestamp() {
    if let Ok(timestamp) = SystemTime::now().duration_since(UNIX_EPOCH) {
        let time = (timestamp.as_secs() * 1_000_000 + u64::from(timestamp.subsec_micros())) as u32;
        eprint!("[{:7}.{:03}]", time / 1000, time % 1000);
    }
}
