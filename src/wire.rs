//! Types and routines used to manipulate arguments from the wire format

use std::collections::VecDeque;
use std::ffi::CStr;
use std::os::unix::io::{BorrowedFd, OwnedFd, RawFd};

use smallvec::SmallVec;

use crate::protocol::{AllowNull, Argument, ArgumentType, Message};

/// Size of the message header: sender id, then opcode and size packed in one word
pub const HEADER_SIZE: usize = 8;
/// Maximum number of bytes of a single wayland message, header included
pub const MAX_BYTES_OUT: usize = 4096;

/// Error generated when trying to serialize a message into buffers
#[derive(Debug, thiserror::Error)]
pub enum MessageWriteError {
    /// The buffer is too small to hold the message contents
    #[error("The provided buffer is too small to hold message content.")]
    BufferTooSmall,
    /// The message would exceed the maximum size of a wire message
    #[error("The message is {0} bytes long, more than the 4096 bytes allowed.")]
    TooBig(usize),
    /// The arguments do not match the signature of the message
    #[error("The message arguments do not match its signature.")]
    SignatureMismatch,
    /// A null string or object was given for a non-nullable argument
    #[error("Argument {0} is null but its type does not allow it.")]
    NullNotAllowed(usize),
    /// The message contains a negative FD
    #[error("Argument {0} is not a valid file descriptor.")]
    InvalidFd(usize),
    /// The message contains a FD that could not be dup-ed
    #[error("The message contains a file descriptor that could not be dup()-ed ({0}).")]
    DupFdFailed(#[source] std::io::Error),
}

/// Error generated when trying to deserialize a message from buffers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageParseError {
    /// The message references a FD but the buffer FD is empty
    #[error("The message references a FD but the buffer FD is empty.")]
    MissingFd,
    /// More data is needed to deserialize the message
    #[error("More data is needed to deserialize the message.")]
    MissingData,
    /// The size of the message is not word-aligned or smaller than its header
    #[error("The message size is not a multiple of 4 or is smaller than the header.")]
    Unaligned,
    /// The declared size of the message exceeds the maximum message size
    #[error("The message declares a size of {0} bytes, more than the 4096 bytes allowed.")]
    TooLarge(usize),
    /// The message contains more bytes than its signature accounts for
    #[error("The message is longer than its signature.")]
    TrailingData,
    /// A string or array is followed by non-zero padding
    #[error("The padding of a string or array is not zeroed.")]
    BadPadding,
    /// A string argument is not nul-terminated or contains an interior nul
    #[error("A string argument is not a valid nul-terminated string.")]
    InvalidString,
    /// A null string or object was received for a non-nullable argument
    #[error("A non-nullable argument is null.")]
    NullNotAllowed,
    /// A signature contains an unknown type code
    #[error("Unknown argument type code {0:?}.")]
    UnknownType(char),
}

/// The fixed-size header of a wire message
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Header {
    /// Id of the object the message is addressed to or sent from
    pub sender_id: u32,
    /// Opcode of the message in the object's interface
    pub opcode: u16,
    /// Total size of the message in bytes, header included
    pub size: usize,
}

impl Header {
    /// Parse the header at the start of `data`
    ///
    /// Returns `Ok(None)` if fewer than [`HEADER_SIZE`] bytes are available.
    pub fn parse(data: &[u8]) -> Result<Option<Self>, MessageParseError> {
        if data.len() < HEADER_SIZE {
            return Ok(None);
        }
        let sender_id = read_word(data, 0);
        let word_2 = read_word(data, 4);
        let opcode = (word_2 & 0x0000_FFFF) as u16;
        let size = (word_2 >> 16) as usize;
        if size < HEADER_SIZE || size % 4 != 0 {
            return Err(MessageParseError::Unaligned);
        }
        if size > MAX_BYTES_OUT {
            return Err(MessageParseError::TooLarge(size));
        }
        Ok(Some(Self { sender_id, opcode, size }))
    }
}

#[inline]
fn read_word(data: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

#[inline]
fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

/// Parse a libwayland signature string such as `"2uf?o"`
///
/// A leading version number is skipped and `?` marks the following string or object
/// as nullable.
pub fn parse_signature(signature: &str) -> Result<Vec<ArgumentType>, MessageParseError> {
    let mut types = Vec::with_capacity(signature.len());
    let mut nullable = false;
    for c in signature.chars().skip_while(char::is_ascii_digit) {
        if c == '?' {
            nullable = true;
            continue;
        }
        let typ = ArgumentType::from_code(c, nullable).ok_or(MessageParseError::UnknownType(c))?;
        types.push(typ);
        nullable = false;
    }
    Ok(types)
}

/// Number of bytes the message will occupy on the wire
pub fn encoded_size<Id, Fd>(msg: &Message<Id, Fd>) -> usize {
    HEADER_SIZE
        + msg
            .args
            .iter()
            .map(|arg| match arg {
                Argument::Str(Some(s)) => 4 + padded_len(s.as_bytes_with_nul().len()),
                Argument::Str(None) => 4,
                Argument::Array(a) => 4 + padded_len(a.len()),
                Argument::Fd(_) => 0,
                _ => 4,
            })
            .sum::<usize>()
}

/// Serialize the contents of this message into provided buffers
///
/// Returns the number of bytes written in `payload`. Any serialized Fd is `dup()`-ed and
/// appended to `fds`. Nothing is written if an error is returned.
pub fn write_to_buffers(
    msg: &Message<u32, RawFd>,
    signature: &[ArgumentType],
    payload: &mut [u8],
    fds: &mut Vec<OwnedFd>,
) -> Result<usize, MessageWriteError> {
    if !crate::protocol::args_match_signature(signature, &msg.args) {
        return Err(MessageWriteError::SignatureMismatch);
    }
    for (i, (typ, arg)) in signature.iter().zip(msg.args.iter()).enumerate() {
        let null = match arg {
            Argument::Str(s) => s.is_none(),
            Argument::Object(o) => *o == 0,
            _ => false,
        };
        if null
            && matches!(typ, ArgumentType::Str(AllowNull::No) | ArgumentType::Object(AllowNull::No))
        {
            return Err(MessageWriteError::NullNotAllowed(i));
        }
    }

    let size = encoded_size(msg);
    if size > MAX_BYTES_OUT {
        return Err(MessageWriteError::TooBig(size));
    }
    if size > payload.len() {
        return Err(MessageWriteError::BufferTooSmall);
    }

    let mut pending_fds = Vec::new();
    for (i, arg) in msg.args.iter().enumerate() {
        if let Argument::Fd(fd) = *arg {
            if fd < 0 {
                return Err(MessageWriteError::InvalidFd(i));
            }
            // SAFETY: the caller keeps the fd open for the duration of the call
            let dup_fd = unsafe { BorrowedFd::borrow_raw(fd) }
                .try_clone_to_owned()
                .map_err(MessageWriteError::DupFdFailed)?;
            pending_fds.push(dup_fd);
        }
    }

    let mut cursor = Cursor { buf: &mut payload[..size], pos: 0 };
    cursor.word(msg.sender_id);
    cursor.word(((size as u32) << 16) | u32::from(msg.opcode));
    for arg in &msg.args {
        match *arg {
            Argument::Int(i) => cursor.word(i as u32),
            Argument::Uint(u) => cursor.word(u),
            Argument::Fixed(f) => cursor.word(f as u32),
            Argument::Str(Some(ref s)) => cursor.array(s.as_bytes_with_nul()),
            Argument::Str(None) => cursor.array(&[]),
            Argument::Object(o) => cursor.word(o),
            Argument::NewId(n) => cursor.word(n),
            Argument::Array(ref a) => cursor.array(a),
            Argument::Fd(_) => {}
        }
    }
    debug_assert_eq!(cursor.pos, size);

    fds.extend(pending_fds);
    Ok(size)
}

/// Serialize a message into freshly allocated buffers
pub fn encode_message(
    msg: &Message<u32, RawFd>,
    signature: &[ArgumentType],
) -> Result<(Vec<u8>, Vec<OwnedFd>), MessageWriteError> {
    let mut bytes = vec![0; encoded_size(msg).min(MAX_BYTES_OUT)];
    let mut fds = Vec::new();
    let len = write_to_buffers(msg, signature, &mut bytes, &mut fds)?;
    bytes.truncate(len);
    Ok((bytes, fds))
}

struct Cursor<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn word(&mut self, value: u32) {
        self.buf[self.pos..self.pos + 4].copy_from_slice(&value.to_ne_bytes());
        self.pos += 4;
    }

    // length prefix, contents, then zeroed padding up to the next word
    fn array(&mut self, contents: &[u8]) {
        self.word(contents.len() as u32);
        let padded = padded_len(contents.len());
        self.buf[self.pos..self.pos + contents.len()].copy_from_slice(contents);
        self.buf[self.pos + contents.len()..self.pos + padded].fill(0);
        self.pos += padded;
    }
}

/// Attempts to parse a single wayland message with the given signature.
///
/// If the buffer contains several messages, only the first one is parsed, and the number
/// of bytes it occupied is returned alongside it. File descriptors are popped from the
/// front of `fds` in signature order; they are left untouched if parsing fails before any
/// argument is read.
///
/// Errors with [`MessageParseError::MissingData`] if the buffer is shorter than the size
/// declared in the header.
pub fn parse_message(
    data: &[u8],
    signature: &[ArgumentType],
    fds: &mut VecDeque<OwnedFd>,
) -> Result<(Message<u32, OwnedFd>, usize), MessageParseError> {
    let header = Header::parse(data)?.ok_or(MessageParseError::MissingData)?;
    if data.len() < header.size {
        return Err(MessageParseError::MissingData);
    }
    if signature.iter().filter(|typ| typ.is_fd()).count() > fds.len() {
        return Err(MessageParseError::MissingFd);
    }

    let mut payload = &data[HEADER_SIZE..header.size];

    fn take_word(payload: &mut &[u8]) -> Result<u32, MessageParseError> {
        if payload.len() < 4 {
            return Err(MessageParseError::MissingData);
        }
        let word = read_word(payload, 0);
        *payload = &payload[4..];
        Ok(word)
    }

    fn take_array<'a>(payload: &mut &'a [u8]) -> Result<&'a [u8], MessageParseError> {
        let len = take_word(payload)? as usize;
        let padded = padded_len(len);
        if padded > payload.len() {
            return Err(MessageParseError::MissingData);
        }
        let (contents, padding) = payload[..padded].split_at(len);
        if padding.iter().any(|&b| b != 0) {
            return Err(MessageParseError::BadPadding);
        }
        *payload = &payload[padded..];
        Ok(contents)
    }

    let mut args = SmallVec::with_capacity(signature.len());
    for typ in signature.iter().copied() {
        let arg = match typ {
            ArgumentType::Fd => match fds.pop_front() {
                Some(fd) => Argument::Fd(fd),
                None => return Err(MessageParseError::MissingFd),
            },
            ArgumentType::Int => Argument::Int(take_word(&mut payload)? as i32),
            ArgumentType::Uint => Argument::Uint(take_word(&mut payload)?),
            ArgumentType::Fixed => Argument::Fixed(take_word(&mut payload)? as i32),
            ArgumentType::Str(null) => {
                let contents = take_array(&mut payload)?;
                if contents.is_empty() {
                    if null == AllowNull::No {
                        return Err(MessageParseError::NullNotAllowed);
                    }
                    Argument::Str(None)
                } else {
                    let s = CStr::from_bytes_with_nul(contents)
                        .map_err(|_| MessageParseError::InvalidString)?;
                    Argument::Str(Some(Box::new(s.into())))
                }
            }
            ArgumentType::Object(null) => {
                let id = take_word(&mut payload)?;
                if id == 0 && null == AllowNull::No {
                    return Err(MessageParseError::NullNotAllowed);
                }
                Argument::Object(id)
            }
            ArgumentType::NewId => Argument::NewId(take_word(&mut payload)?),
            ArgumentType::Array => {
                Argument::Array(Box::new(take_array(&mut payload)?.to_vec()))
            }
        };
        args.push(arg);
    }

    if !payload.is_empty() {
        return Err(MessageParseError::TrailingData);
    }

    Ok((Message { sender_id: header.sender_id, opcode: header.opcode, args }, header.size))
}
