//! Types and utilities for manipulating the Wayland protocol

use std::ffi::CString;
use std::os::unix::io::AsRawFd;

use crate::signature;

/// Enum of possible argument types as recognized by the wire
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ArgumentType {
    /// An integer argument. Represented by an [`i32`].
    Int,
    /// An unsigned integer argument. Represented by a [`u32`].
    Uint,
    /// A signed fixed point number with 1/256 precision
    Fixed,
    /// A string, represented as a [`CString`] in a message.
    Str,
    /// Id of a wayland object
    Object,
    /// Id of a newly created wayland object
    NewId,
    /// `Vec<u8>`
    Array,
    /// A file descriptor argument. No payload on the byte stream, the
    /// value rides on the ancillary channel.
    Fd,
}

/// Enum of possible argument of the protocol
///
/// The `Id` parameter is the representation of object ids (a plain
/// `u32` at the wire level, a richer handle at the server level), the
/// `Fd` parameter the representation of file descriptors (`RawFd` on
/// the sending side, `OwnedFd` on the receiving side).
#[derive(Debug, Clone)]
#[allow(clippy::box_collection)]
pub enum Argument<Id, Fd> {
    /// An integer argument. Represented by an [`i32`].
    Int(i32),
    /// An unsigned integer argument. Represented by a [`u32`].
    Uint(u32),
    /// A signed fixed point number with 1/256 precision
    Fixed(i32),
    /// A string; `None` is the null string.
    ///
    /// The value is boxed to reduce the stack size of Argument. The
    /// performance impact is negligible as `string` arguments are
    /// pretty rare in the protocol.
    Str(Option<Box<CString>>),
    /// Id of a wayland object
    Object(Id),
    /// Id of a newly created wayland object
    NewId(Id),
    /// `Vec<u8>`; `None` is the null array.
    ///
    /// The value is boxed to reduce the stack size of Argument.
    Array(Option<Box<Vec<u8>>>),
    /// A file descriptor argument.
    Fd(Fd),
}

impl<Id, Fd> Argument<Id, Fd> {
    /// Retrieve the type of a given argument instance
    pub fn get_type(&self) -> ArgumentType {
        match *self {
            Self::Int(_) => ArgumentType::Int,
            Self::Uint(_) => ArgumentType::Uint,
            Self::Fixed(_) => ArgumentType::Fixed,
            Self::Str(_) => ArgumentType::Str,
            Self::Object(_) => ArgumentType::Object,
            Self::NewId(_) => ArgumentType::NewId,
            Self::Array(_) => ArgumentType::Array,
            Self::Fd(_) => ArgumentType::Fd,
        }
    }

    fn map_fd<T>(self, f: &mut impl FnMut(Fd) -> T) -> Argument<Id, T> {
        match self {
            Self::Int(val) => Argument::Int(val),
            Self::Uint(val) => Argument::Uint(val),
            Self::Fixed(val) => Argument::Fixed(val),
            Self::Str(val) => Argument::Str(val),
            Self::Object(val) => Argument::Object(val),
            Self::NewId(val) => Argument::NewId(val),
            Self::Array(val) => Argument::Array(val),
            Self::Fd(val) => Argument::Fd(f(val)),
        }
    }
}

impl<Id: PartialEq, Fd: AsRawFd> PartialEq for Argument<Id, Fd> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Uint(a), Self::Uint(b)) => a == b,
            (Self::Fixed(a), Self::Fixed(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a == b,
            (Self::NewId(a), Self::NewId(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Fd(a), Self::Fd(b)) => a.as_raw_fd() == b.as_raw_fd(),
            _ => false,
        }
    }
}

impl<Id: Eq, Fd: AsRawFd> Eq for Argument<Id, Fd> {}

impl<Id: std::fmt::Display, Fd: AsRawFd> std::fmt::Display for Argument<Id, Fd> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Uint(value) => write!(f, "{value}"),
            Self::Fixed(value) => write!(f, "{:.4}", fixed_to_f64(*value)),
            Self::Str(value) => write!(f, "{value:?}"),
            Self::Object(value) => write!(f, "{value}"),
            Self::NewId(value) => write!(f, "{value}"),
            Self::Array(value) => write!(f, "{value:?}"),
            Self::Fd(value) => write!(f, "{}", value.as_raw_fd()),
        }
    }
}

/// Number of arguments that are stocked inline in a `Message` before allocating
pub const INLINE_ARGS: usize = 4;

/// Represents a message that has been sent from some object.
///
/// Holds the frame header (sender and opcode), the decoded arguments
/// and any attached file descriptors; ready to be either serialized to
/// the wire or handed to a request handler.
#[derive(Clone, Debug)]
pub struct Message<Id, Fd> {
    /// The id of the object that sent the message.
    pub sender_id: Id,
    /// The opcode of the message.
    pub opcode: u16,
    /// The arguments of the message.
    pub args: smallvec::SmallVec<[Argument<Id, Fd>; INLINE_ARGS]>,
}

impl<Id, Fd> Message<Id, Fd> {
    /// Map some closure on all Fd contained in this message, to change the Fd generic parameter.
    pub fn map_fd<T>(self, mut f: impl FnMut(Fd) -> T) -> Message<Id, T> {
        Message {
            sender_id: self.sender_id,
            opcode: self.opcode,
            args: self.args.into_iter().map(move |arg| arg.map_fd(&mut f)).collect(),
        }
    }
}

impl<Id: PartialEq, Fd: AsRawFd> PartialEq for Message<Id, Fd> {
    fn eq(&self, other: &Self) -> bool {
        self.sender_id == other.sender_id && self.opcode == other.opcode && self.args == other.args
    }
}

impl<Id: Eq, Fd: AsRawFd> Eq for Message<Id, Fd> {}

/// Wire metadata of a given message
///
/// These tables are produced by the protocol compiler; the signature
/// string and the types slice together drive the codec and the
/// dispatcher.
#[derive(Copy, Clone, Debug)]
pub struct MessageDesc {
    /// Name of this message
    pub name: &'static str,
    /// Signature of the message: an optional leading since-version,
    /// then one character per wire argument (see [`crate::signature`]).
    pub signature: &'static str,
    /// Peer interface of each wire argument, `None` for scalars.
    ///
    /// Messages without any interfaced argument all share a common
    /// all-`None` run and may be longer than their own argument count;
    /// consumers index it per argument position.
    pub types: &'static [Option<&'static Interface>],
    /// Whether this message destroys its sender
    pub is_destructor: bool,
}

impl MessageDesc {
    /// Minimum interface version required for this message.
    pub fn since(&self) -> u32 {
        signature::since_version(self.signature)
    }

    /// Number of wire arguments of this message.
    pub fn arg_count(&self) -> usize {
        signature::arg_count(self.signature)
    }
}

/// Description of a wayland interface.
///
/// An interface describes the possible requests and events that a
/// wayland client and server use to communicate. Requests and events
/// are addressed by their index in these tables (the opcode).
#[derive(Debug)]
pub struct Interface {
    /// The name of the interface.
    pub name: &'static str,
    /// The maximum supported version of the interface.
    pub version: u32,
    /// A list that describes every request this interface supports.
    pub requests: &'static [MessageDesc],
    /// A list that describes every event this interface supports.
    pub events: &'static [MessageDesc],
}

impl std::fmt::Display for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

/// Special interface representing an anonymous object
pub static ANONYMOUS_INTERFACE: Interface =
    Interface { name: "<anonymous>", version: 0, requests: &[], events: &[] };

/// Description of the protocol-level information of an object
#[derive(Copy, Clone, Debug)]
pub struct ObjectInfo {
    /// The protocol ID
    pub id: u32,
    /// The interface
    pub interface: &'static Interface,
    /// The version
    pub version: u32,
}

/// A protocol error
///
/// Generated by the server when a client breaks the protocol, just
/// before the connection is torn down.
#[derive(Clone, Debug)]
pub struct ProtocolError {
    /// The error code, an instance of the `Error` enum of the
    /// associated interface.
    pub code: u32,
    /// The id of the object that caused the error
    pub object_id: u32,
    /// The interface of the object that caused the error
    pub object_interface: String,
    /// The message describing the error
    pub message: String,
}

impl std::error::Error for ProtocolError {}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> Result<(), ::std::fmt::Error> {
        write!(
            f,
            "Protocol error {} on object {}@{}: {}",
            self.code, self.object_interface, self.object_id, self.message
        )
    }
}

/// Returns true if the two interfaces are the same.
#[inline]
pub fn same_interface(a: &'static Interface, b: &'static Interface) -> bool {
    std::ptr::eq(a, b) || a.name == b.name
}

#[inline]
pub fn same_interface_or_anonymous(a: &'static Interface, b: &'static Interface) -> bool {
    same_interface(a, b) || same_interface(a, &ANONYMOUS_INTERFACE)
}

/// Check that an argument list has the shape a signature declares.
///
/// Only counts and argument kinds are verified here; null permissions
/// are enforced by the marshalling code.
pub fn check_for_signature<Id, Fd>(signature: &str, args: &[Argument<Id, Fd>]) -> bool {
    let mut args = args.iter();
    for spec in signature::signature_args(signature) {
        let spec = match spec {
            Ok(spec) => spec,
            Err(_) => return false,
        };
        match args.next() {
            Some(arg) if arg.get_type() == spec.kind => {}
            _ => return false,
        }
    }
    args.next().is_none()
}

/// Encode a floating point value into 24.8 fixed point.
pub fn fixed_from_f64(value: f64) -> i32 {
    (value * 256.0).round() as i32
}

/// Decode a 24.8 fixed point value.
pub fn fixed_to_f64(value: i32) -> f64 {
    value as f64 / 256.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_check_accepts_matching_args() {
        let args: Vec<Argument<u32, std::os::unix::io::RawFd>> = vec![
            Argument::Uint(1),
            Argument::Str(None),
            Argument::Object(3),
        ];
        assert!(check_for_signature("2u?so", &args));
        assert!(!check_for_signature("u?s", &args));
        assert!(!check_for_signature("u?soi", &args));
        assert!(!check_for_signature("uso", &[Argument::<u32, i32>::Int(0)]));
    }

    #[test]
    fn fixed_encoding_round_trips() {
        for value in [1234.5678, -90000.2390, ((1 << 23) - 1) as f64 + 0.0941] {
            let raw = fixed_from_f64(value);
            assert!((fixed_to_f64(raw) - value).abs() < 1.0 / 256.0);
        }
        assert_eq!(fixed_from_f64(-1.0), -256);
    }
}
