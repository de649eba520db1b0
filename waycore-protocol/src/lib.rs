//! Wire-level building blocks for a Wayland server.
//!
//! This crate contains everything below the dispatch layer:
//!
//! - the typed representation of protocol messages and interfaces
//!   ([`protocol`]),
//! - decoding of the compact signature strings emitted by the protocol
//!   compiler ([`signature`]),
//! - the codec turning messages into wire bytes and back ([`wire`]),
//! - the buffered unix socket carrying those bytes along with their
//!   ancillary file descriptors ([`socket`]),
//! - the hard-coded tables for the three frozen core interfaces
//!   ([`core_interfaces`]).
//!
//! The server crate (`waycore-server`) builds the object map, dispatch
//! and registry logic on top of these types.

pub mod core_interfaces;
pub mod debug;
pub mod protocol;
pub mod signature;
pub mod socket;
pub mod wire;

pub use protocol::{
    check_for_signature, fixed_from_f64, fixed_to_f64, same_interface, Argument, ArgumentType,
    Interface, Message, MessageDesc, ObjectInfo, ProtocolError, ANONYMOUS_INTERFACE, INLINE_ARGS,
};
pub use signature::{arg_count, signature_args, since_version, ArgSpec};

/// Build a [`Message`] from its sender id, opcode and argument list.
#[macro_export]
macro_rules! message {
    ($sender_id:expr, $opcode:expr, [$($args:expr),* $(,)?] $(,)?) => {
        $crate::protocol::Message {
            sender_id: $sender_id,
            opcode: $opcode,
            args: $crate::smallvec::smallvec![$($args),*],
        }
    }
}

// Re-exported for use by the `message!` macro.
#[doc(hidden)]
pub use smallvec;
