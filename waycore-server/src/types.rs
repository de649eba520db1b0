//! Common public types of the server core.

use waycore_protocol::protocol::{Interface, ProtocolError};

/// Describes why a client has been disconnected from the server.
#[derive(Debug)]
pub enum DisconnectReason {
    /// The connection has been closed by the server or client.
    ConnectionClosed,
    /// The server has sent the client a protocol error, terminating
    /// the connection.
    ProtocolError(ProtocolError),
}

/// An error generated when trying to act on an invalid object id.
#[derive(Clone, Debug)]
pub struct InvalidId;

impl std::error::Error for InvalidId {}

impl std::fmt::Display for InvalidId {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> Result<(), ::std::fmt::Error> {
        write!(f, "Invalid Id")
    }
}

/// An error generated when an event could not be sent.
#[derive(Debug)]
pub enum SendError {
    /// The target object or one of the argument objects is dead.
    InvalidId,
    /// A null value was passed for a non-nullable argument; nothing
    /// was queued.
    NullArgument,
    /// The marshalled frame would exceed the maximum message size;
    /// nothing was queued.
    TooBig,
}

impl std::error::Error for SendError {}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> Result<(), ::std::fmt::Error> {
        match self {
            Self::InvalidId => f.write_str("invalid object id"),
            Self::NullArgument => f.write_str("null value for a non-nullable argument"),
            Self::TooBig => f.write_str("message does not fit in a frame"),
        }
    }
}

/// Holder of the client credentials, snapshotted from the kernel when
/// the client was accepted.
#[derive(Debug, Clone, Copy)]
pub struct Credentials {
    /// pid of the client
    pub pid: i32,
    /// uid of the client
    pub uid: u32,
    /// gid of the client
    pub gid: u32,
}

/// Description of a global advertised to the clients.
#[derive(Debug)]
pub struct GlobalInfo {
    /// The interface of the global.
    pub interface: &'static Interface,
    /// The version of the global that is advertised to clients.
    pub version: u32,
}

bitflags::bitflags! {
    /// Readiness mask of a client connection, as reported by the
    /// reactor driving the server.
    pub struct Readiness: u32 {
        /// Data can be read from the connection.
        const READABLE = 0x01;
        /// The connection accepts writes again.
        const WRITABLE = 0x02;
        /// The connection errored out.
        const ERROR = 0x04;
        /// The peer hung up.
        const HANGUP = 0x08;
    }
}
