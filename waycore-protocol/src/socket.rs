//! Unix socket handling, with ancillary file descriptor passing

use std::collections::VecDeque;
use std::io::{ErrorKind, IoSlice, IoSliceMut, Result as IoResult};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::errno::Errno;
use nix::sys::socket;

use crate::protocol::Message;
use crate::wire::{parse_message, write_to_buffers, MessageParseError, MessageWriteError};

use smallvec::SmallVec;

/// Maximum number of FD that can be sent in a single socket message
pub const MAX_FDS_OUT: usize = 28;
/// Maximum number of bytes that can be sent in a single socket message
pub const MAX_BYTES_OUT: usize = 4096;

/*
 * Socket
 */

/// A connection socket
#[derive(Debug)]
pub struct Socket {
    stream: UnixStream,
}

impl Socket {
    /// Send a single message to the socket
    ///
    /// A single socket message can contain several protocol messages.
    ///
    /// The `fds` slice should not be longer than `MAX_FDS_OUT`, and the `bytes`
    /// slice should not be longer than `MAX_BYTES_OUT` otherwise the receiving
    /// end may lose some data.
    pub fn send_msg(&self, bytes: &[u8], fds: &[OwnedFd]) -> IoResult<usize> {
        let flags = socket::MsgFlags::MSG_DONTWAIT | socket::MsgFlags::MSG_NOSIGNAL;
        let iov = [IoSlice::new(bytes)];

        let written = if !fds.is_empty() {
            let raw_fds: SmallVec<[RawFd; MAX_FDS_OUT]> =
                fds.iter().map(AsRawFd::as_raw_fd).collect();
            let cmsgs = [socket::ControlMessage::ScmRights(&raw_fds)];
            socket::sendmsg::<()>(self.stream.as_raw_fd(), &iov, &cmsgs, flags, None)?
        } else {
            socket::sendmsg::<()>(self.stream.as_raw_fd(), &iov, &[], flags, None)?
        };
        Ok(written)
    }

    /// Receive a single message from the socket
    ///
    /// Returns the number of bytes received; received fds are appended
    /// to `fds` and are close-on-exec (`MSG_CMSG_CLOEXEC`).
    ///
    /// Errors with `WouldBlock` if no message is available.
    pub fn rcv_msg(&self, buffer: &mut [u8], fds: &mut VecDeque<OwnedFd>) -> IoResult<usize> {
        let mut cmsg = nix::cmsg_space!([RawFd; MAX_FDS_OUT]);
        let mut iov = [IoSliceMut::new(buffer)];

        let msg = socket::recvmsg::<()>(
            self.stream.as_raw_fd(),
            &mut iov[..],
            Some(&mut cmsg),
            socket::MsgFlags::MSG_DONTWAIT
                | socket::MsgFlags::MSG_CMSG_CLOEXEC
                | socket::MsgFlags::MSG_NOSIGNAL,
        )?;

        let received_fds = msg.cmsgs().flat_map(|cmsg| match cmsg {
            socket::ControlMessageOwned::ScmRights(fds) => fds,
            _ => Vec::new(),
        });
        fds.extend(received_fds.map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
        Ok(msg.bytes)
    }
}

impl From<UnixStream> for Socket {
    fn from(stream: UnixStream) -> Self {
        Self { stream }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/*
 * BufferedSocket
 */

/// An adapter around a raw Socket that directly handles buffering and
/// conversion from/to protocol messages
#[derive(Debug)]
pub struct BufferedSocket {
    socket: Socket,
    in_data: Buffer,
    in_fds: VecDeque<OwnedFd>,
    out_data: Buffer,
    out_fds: Vec<OwnedFd>,
}

impl BufferedSocket {
    /// Wrap a Socket into a Buffered Socket
    pub fn new(socket: Socket) -> Self {
        Self {
            socket,
            // the read side holds two messages' worth, so a frame
            // split across two socket reads has somewhere to land
            in_data: Buffer::with_capacity(2 * MAX_BYTES_OUT),
            in_fds: VecDeque::new(),
            out_data: Buffer::with_capacity(MAX_BYTES_OUT),
            out_fds: Vec::new(),
        }
    }

    /// Flush as much of the outgoing buffer as the socket will take.
    ///
    /// A partial write is not an error; whatever the socket refused
    /// stays queued for the next flush. Fds that went out are closed.
    pub fn flush(&mut self) -> IoResult<()> {
        let mut sent = 0;
        let mut fds_sent = 0;
        let outcome = loop {
            let backlog = &self.out_data.unread()[sent..];
            if backlog.is_empty() {
                break Ok(());
            }
            let fd_backlog = &self.out_fds[fds_sent..];
            // one sendmsg carries at most MAX_FDS_OUT fds; with a
            // larger fd backlog, ship each full chunk on a single byte
            // of data so the fds cannot outlast the bytes paying for
            // them
            let (chunk, fd_chunk) = if fd_backlog.len() > MAX_FDS_OUT {
                (&backlog[..1], &fd_backlog[..MAX_FDS_OUT])
            } else {
                (&backlog[..backlog.len().min(MAX_BYTES_OUT)], fd_backlog)
            };
            match self.socket.send_msg(chunk, fd_chunk) {
                Ok(count) => {
                    sent += count;
                    fds_sent += fd_chunk.len();
                    if count == 0 {
                        break Ok(());
                    }
                }
                Err(e) => break Err(e),
            }
        };
        self.out_data.consume(sent);
        self.out_data.compact();
        self.out_fds.drain(..fds_sent);
        outcome
    }

    // serialize a message into the free tail of the outgoing buffer;
    // false means it did not fit
    fn try_queue(&mut self, msg: &Message<u32, RawFd>, signature: &str) -> IoResult<bool> {
        match write_to_buffers(msg, signature, self.out_data.free_space(), &mut self.out_fds) {
            Ok(size) => {
                self.out_data.commit(size);
                Ok(true)
            }
            Err(MessageWriteError::BufferTooSmall) => Ok(false),
            Err(MessageWriteError::NullArgument(_)) => Err(Errno::EINVAL.into()),
            Err(MessageWriteError::DupFdFailed(e)) => Err(e),
        }
    }

    /// Queue a message in the outgoing buffer.
    ///
    /// Queuing never writes to the socket by itself; frames accumulate
    /// until [`flush`] is called. A full buffer is flushed to make
    /// room first.
    ///
    /// Errors with `EINVAL` if a null value is passed for a
    /// non-nullable argument, and with `E2BIG` if the frame exceeds
    /// the maximum message size.
    ///
    /// [`flush`]: Self::flush
    pub fn write_message(&mut self, msg: &Message<u32, RawFd>, signature: &str) -> IoResult<()> {
        if self.try_queue(msg, signature)? {
            return Ok(());
        }
        // out of room: push the backlog out and retry once
        match self.flush() {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
        if self.try_queue(msg, signature)? {
            Ok(())
        } else {
            // an empty buffer was still not enough, the frame can
            // never be sent
            Err(Errno::E2BIG.into())
        }
    }

    /// Pull whatever the socket has pending into the incoming buffers,
    /// to prepare a new round of parsing.
    pub fn fill_incoming_buffers(&mut self) -> IoResult<()> {
        self.in_data.compact();
        let received = self.socket.rcv_msg(self.in_data.free_space(), &mut self.in_fds)?;
        if received == 0 {
            // a zero-sized read is the peer hanging up
            return Err(Errno::EPIPE.into());
        }
        self.in_data.commit(received);
        Ok(())
    }

    /// Decode the first complete message of the incoming buffer.
    ///
    /// The closure resolves an object id and opcode to the declared
    /// signature of that method, or `None` when the pair does not
    /// exist.
    pub fn read_one_message<F>(
        &mut self,
        mut signature: F,
    ) -> Result<Message<u32, OwnedFd>, MessageParseError>
    where
        F: FnMut(u32, u16) -> Option<&'static str>,
    {
        let buffered = self.in_data.unread();
        if buffered.len() < 2 * 4 {
            return Err(MessageParseError::MissingData);
        }
        // peek the header to identify the target method
        let target = u32::from_le_bytes(buffered[..4].try_into().unwrap());
        let opcode = u32::from_le_bytes(buffered[4..8].try_into().unwrap()) as u16;
        let sig = signature(target, opcode).ok_or(MessageParseError::Malformed)?;

        let (msg, remainder) = parse_message(buffered, sig, &mut self.in_fds)?;
        let frame_size = buffered.len() - remainder.len();
        self.in_data.consume(frame_size);

        Ok(msg)
    }

    /// Number of bytes currently queued for sending.
    pub fn pending_bytes(&self) -> usize {
        self.out_data.unread().len()
    }
}

impl AsRawFd for BufferedSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/*
 * Buffer
 */

// A fixed-capacity byte queue. Data lives in `bytes[start..end]`;
// consumed space at the front is reclaimed by `compact`, which keeps
// frames contiguous for the parser.
#[derive(Debug)]
struct Buffer {
    bytes: Vec<u8>,
    start: usize,
    end: usize,
}

impl Buffer {
    fn with_capacity(capacity: usize) -> Self {
        Self { bytes: vec![0; capacity], start: 0, end: 0 }
    }

    /// The queued bytes not yet consumed.
    fn unread(&self) -> &[u8] {
        &self.bytes[self.start..self.end]
    }

    /// The writable tail after the queued bytes.
    fn free_space(&mut self) -> &mut [u8] {
        &mut self.bytes[self.end..]
    }

    /// Mark `count` bytes of the tail as queued.
    fn commit(&mut self, count: usize) {
        self.end += count;
    }

    /// Drop `count` bytes from the front of the queue.
    fn consume(&mut self, count: usize) {
        self.start += count;
    }

    /// Slide the queued bytes back to the front of the storage, so the
    /// whole remaining capacity is writable again.
    fn compact(&mut self) {
        if self.start > 0 {
            self.bytes.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Argument;

    use std::ffi::CString;
    use std::io::Write;
    use std::os::unix::io::IntoRawFd;

    use smallvec::smallvec;

    fn socket_pair() -> (BufferedSocket, BufferedSocket) {
        let (a, b) = UnixStream::pair().unwrap();
        (BufferedSocket::new(Socket::from(a)), BufferedSocket::new(Socket::from(b)))
    }

    fn same_file(a: RawFd, b: RawFd) -> bool {
        let stat1 = nix::sys::stat::fstat(a).unwrap();
        let stat2 = nix::sys::stat::fstat(b).unwrap();
        stat1.st_dev == stat2.st_dev && stat1.st_ino == stat2.st_ino
    }

    fn open_fd_count() -> usize {
        std::fs::read_dir("/proc/self/fd").unwrap().count()
    }

    // check if two messages are equal
    //
    // if arguments contain FDs, check that the fds point to the same
    // file, rather than are the same number.
    fn assert_eq_msgs<Fd: AsRawFd + std::fmt::Debug>(
        msg1: &Message<u32, Fd>,
        msg2: &Message<u32, Fd>,
    ) {
        assert_eq!(msg1.sender_id, msg2.sender_id);
        assert_eq!(msg1.opcode, msg2.opcode);
        assert_eq!(msg1.args.len(), msg2.args.len());
        for (arg1, arg2) in msg1.args.iter().zip(msg2.args.iter()) {
            if let (Argument::Fd(fd1), Argument::Fd(fd2)) = (arg1, arg2) {
                assert!(same_file(fd1.as_raw_fd(), fd2.as_raw_fd()));
            } else {
                assert_eq!(arg1, arg2);
            }
        }
    }

    #[test]
    fn write_read_cycle() {
        let msg = Message {
            sender_id: 42,
            opcode: 7,
            args: smallvec![
                Argument::Uint(3),
                Argument::Fixed(-89),
                Argument::Str(Some(Box::new(CString::new(&b"I like trains!"[..]).unwrap()))),
                Argument::Array(Some(Box::new(vec![1, 2, 3, 4, 5, 6, 7, 8, 9]))),
                Argument::Object(88),
                Argument::NewId(56),
                Argument::Int(-25),
            ],
        };

        let (mut client, mut server) = socket_pair();

        client.write_message(&msg, "ufsaoni").unwrap();
        client.flush().unwrap();

        server.fill_incoming_buffers().unwrap();

        let ret_msg = server
            .read_one_message(
                |sender_id, opcode| {
                    if sender_id == 42 && opcode == 7 {
                        Some("ufsaoni")
                    } else {
                        None
                    }
                },
            )
            .unwrap();

        assert_eq_msgs(&msg, &ret_msg.map_fd(IntoRawFd::into_raw_fd));
    }

    #[test]
    fn write_read_cycle_fd() {
        let file = tempfile::tempfile().unwrap();
        let msg = Message {
            sender_id: 42,
            opcode: 7,
            args: smallvec![Argument::Fd(file.as_raw_fd()), Argument::Fd(1)],
        };

        let (mut client, mut server) = socket_pair();

        client.write_message(&msg, "hh").unwrap();
        client.flush().unwrap();

        server.fill_incoming_buffers().unwrap();

        let ret_msg = server
            .read_one_message(
                |sender_id, opcode| {
                    if sender_id == 42 && opcode == 7 {
                        Some("hh")
                    } else {
                        None
                    }
                },
            )
            .unwrap();

        // the received fd is a different, close-on-exec descriptor for
        // the same file
        if let Argument::Fd(received) = &ret_msg.args[0] {
            assert_ne!(received.as_raw_fd(), file.as_raw_fd());
            let flags = nix::fcntl::fcntl(received.as_raw_fd(), nix::fcntl::FcntlArg::F_GETFD).unwrap();
            assert!(nix::fcntl::FdFlag::from_bits_truncate(flags)
                .contains(nix::fcntl::FdFlag::FD_CLOEXEC));
        } else {
            panic!("expected an fd argument");
        }
        assert_eq_msgs(&msg, &ret_msg.map_fd(IntoRawFd::into_raw_fd));
    }

    #[test]
    fn write_read_cycle_multiple() {
        let messages = vec![
            Message {
                sender_id: 42,
                opcode: 0,
                args: smallvec![
                    Argument::Int(42),
                    Argument::Str(Some(Box::new(CString::new(&b"I like trains"[..]).unwrap()))),
                ],
            },
            Message {
                sender_id: 42,
                opcode: 1,
                args: smallvec![
                    Argument::Fd(1), // stdin
                    Argument::Fd(0), // stdout
                ],
            },
            Message {
                sender_id: 42,
                opcode: 2,
                args: smallvec![
                    Argument::Uint(3),
                    Argument::Fd(2), // stderr
                ],
            },
        ];

        static SIGNATURES: &[&str] = &["is", "hh", "uh"];

        let (mut client, mut server) = socket_pair();

        for msg in &messages {
            client.write_message(msg, SIGNATURES[msg.opcode as usize]).unwrap();
        }
        client.flush().unwrap();

        server.fill_incoming_buffers().unwrap();

        let mut recv_msgs = Vec::new();
        while let Ok(message) = server.read_one_message(|sender_id, opcode| {
            if sender_id == 42 {
                Some(SIGNATURES[opcode as usize])
            } else {
                None
            }
        }) {
            recv_msgs.push(message);
        }
        assert_eq!(recv_msgs.len(), 3);
        for (msg1, msg2) in messages.into_iter().zip(recv_msgs.into_iter()) {
            assert_eq_msgs(&msg1, &msg2.map_fd(IntoRawFd::into_raw_fd));
        }
    }

    #[test]
    fn parse_with_string_len_multiple_of_4() {
        let msg = Message {
            sender_id: 2,
            opcode: 0,
            args: smallvec![
                Argument::Uint(18),
                Argument::Str(Some(Box::new(CString::new(&b"wl_shell"[..]).unwrap()))),
                Argument::Uint(1),
            ],
        };

        let (mut client, mut server) = socket_pair();

        client.write_message(&msg, "usu").unwrap();
        client.flush().unwrap();

        server.fill_incoming_buffers().unwrap();

        let ret_msg = server
            .read_one_message(
                |sender_id, opcode| {
                    if sender_id == 2 && opcode == 0 {
                        Some("usu")
                    } else {
                        None
                    }
                },
            )
            .unwrap();

        assert_eq_msgs(&msg, &ret_msg.map_fd(IntoRawFd::into_raw_fd));
    }

    #[test]
    fn queue_does_not_flush() {
        let msg = Message::<u32, RawFd> {
            sender_id: 5,
            opcode: 0,
            args: smallvec![Argument::Uint(7), Argument::Uint(9)],
        };

        let (mut client, server) = socket_pair();
        server.socket.stream.set_nonblocking(true).unwrap();

        client.write_message(&msg, "uu").unwrap();
        client.write_message(&msg, "uu").unwrap();
        let frame_size = client.pending_bytes() / 2;

        // nothing was written to the socket yet
        let mut probe = [0u8; 1];
        let err = nix::unistd::read(server.socket.as_raw_fd(), &mut probe).unwrap_err();
        assert_eq!(err, Errno::EAGAIN);

        client.flush().unwrap();

        // both frames arrive back to back and are bytewise identical
        let mut received = vec![0u8; 2 * frame_size + 1];
        let count = nix::unistd::read(server.socket.as_raw_fd(), &mut received).unwrap();
        assert_eq!(count, 2 * frame_size);
        assert_eq!(received[..frame_size], received[frame_size..2 * frame_size]);
    }

    #[test]
    fn oversized_message_fails_e2big() {
        let big = vec![b'x'; 5000];
        let msg = Message::<u32, RawFd> {
            sender_id: 4,
            opcode: 0,
            args: smallvec![Argument::Str(Some(Box::new(CString::new(big).unwrap())))],
        };

        let (mut client, _server) = socket_pair();
        let err = client.write_message(&msg, "s").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(Errno::E2BIG as i32));
        assert_eq!(client.pending_bytes(), 0);
    }

    #[test]
    fn fd_cycle_does_not_leak() {
        let (mut client, mut server) = socket_pair();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"ping").unwrap();

        let baseline = open_fd_count();
        for i in 0..2000u32 {
            let msg = Message {
                sender_id: 42,
                opcode: 0,
                args: smallvec![Argument::Uint(i), Argument::Fd(file.as_raw_fd())],
            };
            client.write_message(&msg, "uh").unwrap();
            client.flush().unwrap();
            server.fill_incoming_buffers().unwrap();
            let received = server.read_one_message(|_, _| Some("uh")).unwrap();
            if let Argument::Fd(fd) = &received.args[1] {
                assert!(same_file(fd.as_raw_fd(), file.as_raw_fd()));
            } else {
                panic!("expected an fd argument");
            }
            // the received OwnedFd is dropped here
        }
        assert_eq!(open_fd_count(), baseline);
    }
}
