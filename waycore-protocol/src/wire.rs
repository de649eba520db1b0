//! Serialization and deserialization of messages to and from the wire format

use std::collections::VecDeque;
use std::ffi::CStr;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl;

use crate::protocol::{Argument, ArgumentType, Message};
use crate::signature::signature_args;

use smallvec::SmallVec;

/// Error generated when trying to serialize a message into buffers
#[derive(Debug)]
pub enum MessageWriteError {
    /// The buffer is too small to hold the message contents
    BufferTooSmall,
    /// A null value was provided for the non-nullable argument at this index
    NullArgument(usize),
    /// The message contains a FD that could not be dup-ed
    DupFdFailed(std::io::Error),
}

impl std::error::Error for MessageWriteError {}

impl std::fmt::Display for MessageWriteError {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> Result<(), ::std::fmt::Error> {
        match self {
            Self::BufferTooSmall => {
                f.write_str("The provided buffer is too small to hold message content.")
            }
            Self::NullArgument(idx) => {
                write!(f, "Argument {idx} is null but not declared nullable.")
            }
            Self::DupFdFailed(e) => {
                write!(f, "The message contains a file descriptor that could not be dup()-ed ({e}).")
            }
        }
    }
}

/// Error generated when trying to deserialize a message from buffers
#[derive(Debug, Clone)]
pub enum MessageParseError {
    /// The message references a FD but the buffer FD is empty
    MissingFD,
    /// More data is needed to deserialize the message
    MissingData,
    /// The message is malformed and cannot be parsed
    Malformed,
}

impl std::error::Error for MessageParseError {}

impl std::fmt::Display for MessageParseError {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> Result<(), ::std::fmt::Error> {
        match *self {
            Self::MissingFD => {
                f.write_str("The message references a FD but the buffer FD is empty.")
            }
            Self::MissingData => f.write_str("More data is needed to deserialize the message"),
            Self::Malformed => f.write_str("The message is malformed and cannot be parsed"),
        }
    }
}

/// Serialize the contents of this message into the provided buffers
///
/// Returns the number of bytes written.
///
/// The signature drives the null discipline: a null string, array or
/// object in a slot without the `?` marker fails with
/// [`MessageWriteError::NullArgument`] before anything is written. Any
/// serialized fd is `dup()`-ed close-on-exec; the duplicates are
/// appended to `fds` only once the whole message has been serialized,
/// so a failed write queues nothing.
pub fn write_to_buffers(
    msg: &Message<u32, RawFd>,
    signature: &str,
    payload: &mut [u8],
    fds: &mut Vec<OwnedFd>,
) -> Result<usize, MessageWriteError> {
    for (idx, (spec, arg)) in signature_args(signature).zip(msg.args.iter()).enumerate() {
        let spec = match spec {
            Ok(spec) => spec,
            Err(e) => panic!("invalid signature {signature:?}: {e}"),
        };
        if spec.nullable {
            continue;
        }
        let is_null = match arg {
            Argument::Str(s) => s.is_none(),
            Argument::Array(a) => a.is_none(),
            Argument::Object(id) => *id == 0,
            _ => false,
        };
        if is_null {
            return Err(MessageWriteError::NullArgument(idx));
        }
    }

    let orig_payload_len = payload.len();
    // Helper function to write a u32 to the buffer
    fn write_buf(u: u32, payload: &mut [u8]) -> Result<&mut [u8], MessageWriteError> {
        if payload.len() >= 4 {
            let (head, tail) = payload.split_at_mut(4);
            head.copy_from_slice(&u.to_le_bytes());
            Ok(tail)
        } else {
            Err(MessageWriteError::BufferTooSmall)
        }
    }

    // Helper function to write byte arrays in payload
    fn write_array_to_payload<'a>(
        array: &[u8],
        payload: &'a mut [u8],
    ) -> Result<&'a mut [u8], MessageWriteError> {
        // size header
        let payload = write_buf(array.len() as u32, payload)?;

        let len = next_multiple_of(array.len(), 4);
        if payload.len() < len {
            return Err(MessageWriteError::BufferTooSmall);
        }

        let (buffer_slice, rest) = payload.split_at_mut(len);
        buffer_slice[..array.len()].copy_from_slice(array);
        // the padding must not leak previous buffer contents
        buffer_slice[array.len()..].fill(0);
        Ok(rest)
    }

    let free_size = payload.len();
    if free_size < 2 * 4 {
        return Err(MessageWriteError::BufferTooSmall);
    }

    let (header, mut payload) = payload.split_at_mut(2 * 4);

    // dup-ed fds are committed to `fds` only on success, dropping
    // (and thus closing) them on any early return
    let mut pending_fds = SmallVec::<[OwnedFd; 2]>::new();

    // write the contents in the buffer
    for arg in &msg.args {
        payload = match *arg {
            Argument::Int(i) => write_buf(i as u32, payload)?,
            Argument::Uint(u) => write_buf(u, payload)?,
            Argument::Fixed(f) => write_buf(f as u32, payload)?,
            Argument::Str(Some(ref s)) => write_array_to_payload(s.as_bytes_with_nul(), payload)?,
            Argument::Str(None) => write_array_to_payload(&[], payload)?,
            Argument::Object(o) => write_buf(o, payload)?,
            Argument::NewId(n) => write_buf(n, payload)?,
            Argument::Array(Some(ref a)) => write_array_to_payload(a, payload)?,
            Argument::Array(None) => write_array_to_payload(&[], payload)?,
            Argument::Fd(fd) => {
                pending_fds.push(dup_fd_cloexec(fd).map_err(MessageWriteError::DupFdFailed)?);
                payload
            }
        };
    }

    fds.extend(pending_fds);

    let wrote_size = free_size - payload.len();
    header[..4].copy_from_slice(&msg.sender_id.to_le_bytes());
    header[4..]
        .copy_from_slice(&(((wrote_size as u32) << 16) | u32::from(msg.opcode)).to_le_bytes());
    Ok(orig_payload_len - payload.len())
}

/// Attempts to parse a single message with the given signature.
///
/// If the buffer contains several messages, only the first one is
/// parsed and the unused tail is returned.
///
/// Errors if the message is malformed: a truncated frame, a string
/// without its NUL terminator, an unknown signature character, or a
/// null value in a non-nullable slot.
#[allow(clippy::type_complexity)]
pub fn parse_message<'a>(
    raw: &'a [u8],
    signature: &str,
    fds: &mut VecDeque<OwnedFd>,
) -> Result<(Message<u32, OwnedFd>, &'a [u8]), MessageParseError> {
    // helper function to read arrays
    fn read_array_from_payload(
        array_len: usize,
        payload: &[u8],
    ) -> Result<(&[u8], &[u8]), MessageParseError> {
        let len = next_multiple_of(array_len, 4);
        if len > payload.len() {
            return Err(MessageParseError::MissingData);
        }
        Ok((&payload[..array_len], &payload[len..]))
    }

    if raw.len() < 2 * 4 {
        return Err(MessageParseError::MissingData);
    }

    let sender_id = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let word_2 = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
    let opcode = (word_2 & 0x0000_FFFF) as u16;
    let len = (word_2 >> 16) as usize;

    if len < 2 * 4 || len % 4 != 0 {
        return Err(MessageParseError::Malformed);
    } else if len > raw.len() {
        return Err(MessageParseError::MissingData);
    }

    let fd_len = signature_args(signature)
        .filter(|spec| matches!(spec, Ok(spec) if spec.kind == ArgumentType::Fd))
        .count();
    if fd_len > fds.len() {
        return Err(MessageParseError::MissingFD);
    }

    let (mut payload, rest) = raw.split_at(len);
    payload = &payload[2 * 4..];

    let arguments = signature_args(signature)
        .map(|spec| {
            let spec = spec.map_err(|_| MessageParseError::Malformed)?;
            if let ArgumentType::Fd = spec.kind {
                // consumes no payload, only an fd
                return match fds.pop_front() {
                    Some(front) => Ok(Argument::Fd(front)),
                    None => Err(MessageParseError::MissingFD),
                };
            }
            if payload.len() < 4 {
                return Err(MessageParseError::MissingData);
            }
            let (front, mut tail) = payload.split_at(4);
            let front = u32::from_le_bytes(front.try_into().unwrap());
            let arg = match spec.kind {
                ArgumentType::Int => Ok(Argument::Int(front as i32)),
                ArgumentType::Uint => Ok(Argument::Uint(front)),
                ArgumentType::Fixed => Ok(Argument::Fixed(front as i32)),
                ArgumentType::Str => {
                    read_array_from_payload(front as usize, tail).and_then(|(v, rest)| {
                        tail = rest;
                        if v.is_empty() {
                            if spec.nullable {
                                Ok(Argument::Str(None))
                            } else {
                                Err(MessageParseError::Malformed)
                            }
                        } else {
                            match CStr::from_bytes_with_nul(v) {
                                Ok(s) => Ok(Argument::Str(Some(Box::new(s.into())))),
                                Err(_) => Err(MessageParseError::Malformed),
                            }
                        }
                    })
                }
                ArgumentType::Object => {
                    if front == 0 && !spec.nullable {
                        Err(MessageParseError::Malformed)
                    } else {
                        Ok(Argument::Object(front))
                    }
                }
                ArgumentType::NewId => {
                    if front == 0 && !spec.nullable {
                        Err(MessageParseError::Malformed)
                    } else {
                        Ok(Argument::NewId(front))
                    }
                }
                ArgumentType::Array => {
                    read_array_from_payload(front as usize, tail).map(|(v, rest)| {
                        tail = rest;
                        if v.is_empty() && spec.nullable {
                            Argument::Array(None)
                        } else {
                            Argument::Array(Some(Box::new(v.into())))
                        }
                    })
                }
                ArgumentType::Fd => unreachable!(),
            };
            payload = tail;
            arg
        })
        .collect::<Result<SmallVec<_>, MessageParseError>>()?;

    let msg = Message { sender_id, opcode, args: arguments };
    Ok((msg, rest))
}

/// Duplicate a file descriptor, setting the close-on-exec flag on the copy.
pub fn dup_fd_cloexec(fd: RawFd) -> std::io::Result<OwnedFd> {
    match fcntl::fcntl(fd, fcntl::FcntlArg::F_DUPFD_CLOEXEC(0)) {
        Ok(newfd) => Ok(unsafe { OwnedFd::from_raw_fd(newfd) }),
        Err(Errno::EINVAL) => {
            // F_DUPFD_CLOEXEC is not recognized, kernel too old, fall
            // back to setting the flag in a separate call
            let raw = fcntl::fcntl(fd, fcntl::FcntlArg::F_DUPFD(0))?;
            let newfd = unsafe { OwnedFd::from_raw_fd(raw) };

            let flags = fcntl::fcntl(raw, fcntl::FcntlArg::F_GETFD)
                .map(|f| fcntl::FdFlag::from_bits_truncate(f) | fcntl::FdFlag::FD_CLOEXEC)?;
            fcntl::fcntl(raw, fcntl::FcntlArg::F_SETFD(flags))?;
            Ok(newfd)
        }
        Err(e) => Err(e.into()),
    }
}

// usize::next_multiple_of was stabilized after this crate's MSRV
fn next_multiple_of(lhs: usize, rhs: usize) -> usize {
    match lhs % rhs {
        0 => lhs,
        r => lhs + (rhs - r),
    }
}
