//! Unix socket transport: `SCM_RIGHTS` passing and message buffering

use std::collections::VecDeque;
use std::io::{Error as IoError, ErrorKind, IoSlice, IoSliceMut, Result as IoResult};
use std::mem::MaybeUninit;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use rustix::event::{poll, PollFd, PollFlags};
use rustix::io::retry_on_intr;
use rustix::net::{
    recvmsg, sendmsg, RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags,
};

use crate::protocol::{ArgumentType, Message};
use crate::wire::{
    parse_message, write_to_buffers, Header, MessageParseError, MessageWriteError,
};

pub use crate::wire::MAX_BYTES_OUT;

/// Maximum number of fds attached to a single `sendmsg` call
///
/// This is the limit of the receiving side of libwayland, fds beyond it would be lost.
pub const MAX_FDS_OUT: usize = 28;

// No SIGPIPE when the peer is gone, macOS sets SO_NOSIGPIPE on the socket instead
fn send_flags() -> SendFlags {
    #[cfg(not(target_os = "macos"))]
    return SendFlags::DONTWAIT | SendFlags::NOSIGNAL;
    #[cfg(target_os = "macos")]
    return SendFlags::DONTWAIT;
}

fn recv_flags() -> RecvFlags {
    #[cfg(not(target_os = "macos"))]
    return RecvFlags::DONTWAIT | RecvFlags::CMSG_CLOEXEC;
    #[cfg(target_os = "macos")]
    return RecvFlags::DONTWAIT;
}

/// Non-blocking unix stream carrying file descriptors next to its bytes
#[derive(Debug)]
pub struct Socket {
    stream: UnixStream,
}

impl Socket {
    /// Perform one `sendmsg` with the given bytes, and the given fds as ancillary data
    ///
    /// Returns the number of bytes written. The fds are sent along with the first byte,
    /// so at most [`MAX_FDS_OUT`] of them must be given, with at least one byte.
    pub fn send_msg(&self, bytes: &[u8], fds: &[OwnedFd]) -> IoResult<usize> {
        let borrowed = fds.iter().map(AsFd::as_fd).collect::<Vec<BorrowedFd<'_>>>();
        let mut space = vec![MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(fds.len()))];
        let mut ancillary = SendAncillaryBuffer::new(&mut space);
        if !borrowed.is_empty() {
            ancillary.push(SendAncillaryMessage::ScmRights(&borrowed));
        }
        let iov = [IoSlice::new(bytes)];
        Ok(retry_on_intr(|| sendmsg(&self.stream, &iov, &mut ancillary, send_flags()))?)
    }

    /// Perform one `recvmsg` into `buffer`
    ///
    /// Returns the number of bytes read, `0` meaning the peer hung up. Received fds are
    /// pushed at the back of `fds`. Fails with `WouldBlock` when nothing is available.
    pub fn recv_msg(&self, buffer: &mut [u8], fds: &mut VecDeque<OwnedFd>) -> IoResult<usize> {
        let mut space = [MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(MAX_FDS_OUT))];
        let mut ancillary = RecvAncillaryBuffer::new(&mut space);
        let mut iov = [IoSliceMut::new(buffer)];
        let received =
            retry_on_intr(|| recvmsg(&self.stream, &mut iov, &mut ancillary, recv_flags()))?;

        for cmsg in ancillary.drain() {
            if let RecvAncillaryMessage::ScmRights(rights) = cmsg {
                for fd in rights {
                    // no MSG_CMSG_CLOEXEC there
                    #[cfg(target_os = "macos")]
                    if let Ok(flags) = rustix::io::fcntl_getfd(&fd) {
                        let _ = rustix::io::fcntl_setfd(&fd, flags | rustix::io::FdFlags::CLOEXEC);
                    }
                    fds.push_back(fd);
                }
            }
        }
        Ok(received.bytes)
    }

    /// Block until the socket becomes ready for `events`, or reports an error
    pub fn wait(&self, events: PollFlags) -> IoResult<()> {
        let mut pollfd = [PollFd::new(&self.stream, events | PollFlags::ERR)];
        retry_on_intr(|| poll(&mut pollfd, None))?;
        Ok(())
    }

    /// Shut down both directions, waking up anyone polling the socket
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

impl From<UnixStream> for Socket {
    fn from(stream: UnixStream) -> Self {
        #[cfg(target_os = "macos")]
        let _ = rustix::net::sockopt::set_socket_nosigpipe(&stream, true);
        Self { stream }
    }
}

impl AsFd for Socket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// Error when queuing a message on a [`BufferedSocket`]
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// The message could not be serialized
    #[error(transparent)]
    Message(#[from] MessageWriteError),
    /// The socket failed while making room for the message
    #[error(transparent)]
    Io(#[from] IoError),
}

/// A [`Socket`] with its incoming and outgoing message buffers
///
/// Outgoing messages are serialized into a buffer of [`MAX_BYTES_OUT`] bytes, sent on
/// [`flush()`](Self::flush) or once it is full. Incoming bytes are read by chunks and
/// parsed one message at a time, a partially received message stays buffered until the
/// rest of it arrives.
#[derive(Debug)]
pub struct BufferedSocket {
    socket: Socket,
    incoming: ByteBuffer,
    in_fds: VecDeque<OwnedFd>,
    outgoing: ByteBuffer,
    out_fds: Vec<OwnedFd>,
}

impl BufferedSocket {
    /// Wrap a socket with empty buffers
    pub fn new(socket: Socket) -> Self {
        Self {
            socket,
            // room for a partial message followed by a full one
            incoming: ByteBuffer::with_capacity(2 * MAX_BYTES_OUT),
            in_fds: VecDeque::new(),
            outgoing: ByteBuffer::with_capacity(MAX_BYTES_OUT),
            out_fds: Vec::new(),
        }
    }

    /// The wrapped socket
    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Flush the contents of the outgoing buffer into the socket
    ///
    /// Errors with `WouldBlock` if the socket cannot take all the data right now, in which
    /// case whatever could be written was removed from the buffer.
    pub fn flush(&mut self) -> IoResult<()> {
        let mut sent_bytes = 0;
        let mut sent_fds = 0;
        let result = loop {
            let pending = &self.outgoing.filled()[sent_bytes..];
            if pending.is_empty() {
                break Ok(());
            }
            let fds = &self.out_fds[sent_fds..];
            // Fds exceeding one batch go ahead with a single byte each, so that the last batch
            // still has data to travel with, as libwayland does
            let (chunk, batch) = if fds.len() > MAX_FDS_OUT {
                (&pending[..1], &fds[..MAX_FDS_OUT])
            } else {
                (&pending[..pending.len().min(MAX_BYTES_OUT)], fds)
            };
            match self.socket.send_msg(chunk, batch) {
                Ok(count) => {
                    sent_bytes += count;
                    sent_fds += batch.len();
                    if count == 0 {
                        break Ok(());
                    }
                }
                Err(e) => break Err(e),
            }
        };
        // drop whatever reached the socket, error or not
        self.outgoing.consume(sent_bytes);
        self.outgoing.compact();
        self.out_fds.drain(..sent_fds);
        result
    }

    /// Flush the outgoing buffer, waiting for the socket to accept all of it
    pub fn flush_blocking(&mut self) -> IoResult<()> {
        loop {
            match self.flush() {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::WouldBlock => self.socket.wait(PollFlags::OUT)?,
                Err(e) => return Err(e),
            }
        }
    }

    /// Whether some outgoing data is waiting to be flushed
    pub fn has_pending_output(&self) -> bool {
        !self.outgoing.filled().is_empty()
    }

    // Serialize the message at the end of the outgoing buffer, false if it does not fit
    fn try_queue(
        &mut self,
        msg: &Message<u32, RawFd>,
        signature: &[ArgumentType],
    ) -> Result<bool, MessageWriteError> {
        let spare = self.outgoing.spare();
        let written = match write_to_buffers(msg, signature, spare, &mut self.out_fds) {
            Err(MessageWriteError::BufferTooSmall) => return Ok(false),
            other => other?,
        };
        self.outgoing.commit(written);
        Ok(true)
    }

    /// Queue a message in the outgoing buffer
    ///
    /// The message is queued whole or not at all. When the buffer is full it is flushed
    /// first, blocking until the socket accepts it.
    pub fn write_message(
        &mut self,
        msg: &Message<u32, RawFd>,
        signature: &[ArgumentType],
    ) -> Result<(), WriteError> {
        if self.try_queue(msg, signature)? {
            return Ok(());
        }
        self.flush_blocking()?;
        // oversized messages fail with TooBig, so an empty buffer always has room
        match self.try_queue(msg, signature)? {
            true => Ok(()),
            false => Err(MessageWriteError::BufferTooSmall.into()),
        }
    }

    /// Read what the socket has available into the incoming buffers
    ///
    /// Fails with `WouldBlock` when nothing is available, and with `UnexpectedEof` once
    /// the peer hung up.
    pub fn fill_incoming_buffers(&mut self) -> IoResult<()> {
        self.incoming.compact();
        match self.socket.recv_msg(self.incoming.spare(), &mut self.in_fds)? {
            0 => Err(IoError::new(ErrorKind::UnexpectedEof, "connection closed by peer")),
            count => {
                self.incoming.commit(count);
                Ok(())
            }
        }
    }

    /// Number of received bytes not yet consumed by parsing
    pub fn pending_input(&self) -> usize {
        self.incoming.filled().len()
    }

    /// Parse the header of the next incoming message, if enough bytes are buffered
    pub fn peek_header(&self) -> Result<Option<Header>, MessageParseError> {
        Header::parse(self.incoming.filled())
    }

    /// Decode the next buffered message, with its fds
    ///
    /// The `signature` must be the one of the message whose header is returned by
    /// [`peek_header()`](Self::peek_header). Errors with `MissingData` if the message
    /// is not completely buffered yet, nothing is consumed in that case.
    pub fn read_one_message(
        &mut self,
        signature: &[ArgumentType],
    ) -> Result<Message<u32, OwnedFd>, MessageParseError> {
        let (msg, used) = parse_message(self.incoming.filled(), signature, &mut self.in_fds)?;
        self.incoming.consume(used);
        Ok(msg)
    }
}

impl AsRawFd for BufferedSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl AsFd for BufferedSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

// Fixed size byte storage, filled at the back and consumed from the front
#[derive(Debug)]
struct ByteBuffer {
    storage: Box<[u8]>,
    start: usize,
    end: usize,
}

impl ByteBuffer {
    fn with_capacity(size: usize) -> Self {
        Self { storage: vec![0; size].into_boxed_slice(), start: 0, end: 0 }
    }

    fn filled(&self) -> &[u8] {
        &self.storage[self.start..self.end]
    }

    fn spare(&mut self) -> &mut [u8] {
        &mut self.storage[self.end..]
    }

    // `count` bytes were written in the spare space
    fn commit(&mut self, count: usize) {
        self.end += count;
    }

    fn consume(&mut self, count: usize) {
        self.start += count;
    }

    // move the filled bytes to the front of the storage
    fn compact(&mut self) {
        if self.start > 0 {
            self.storage.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
    }
}
