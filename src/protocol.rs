//! Data model of the protocol: argument kinds, interface tables and messages

use std::{ffi::CString, fmt, os::unix::io::AsRawFd};

/// Nullability of a string or object argument
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AllowNull {
    /// The argument may be null
    Yes,
    /// The argument must carry a value
    No,
}

/// Kind of an argument, as found in a message signature
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ArgumentType {
    /// Signed 32 bits integer
    Int,
    /// Unsigned 32 bits integer
    Uint,
    /// Signed 24.8 fixed point number
    Fixed,
    /// Length-prefixed NUL-terminated string
    Str(AllowNull),
    /// Reference to an existing object
    Object(AllowNull),
    /// Id of the object created by the message
    NewId,
    /// Length-prefixed byte blob
    Array,
    /// File descriptor, passed out of band
    Fd,
}

impl ArgumentType {
    /// Compare the kinds of two argument types, ignoring their nullability
    pub fn same_kind(self, other: Self) -> bool {
        std::mem::discriminant(&self) == std::mem::discriminant(&other)
    }

    /// Map a libwayland signature character to its argument type
    ///
    /// `nullable` is set when the character was preceded by a `?`.
    pub fn from_code(code: char, nullable: bool) -> Option<Self> {
        let null = if nullable { AllowNull::Yes } else { AllowNull::No };
        let typ = match code {
            'i' => Self::Int,
            'u' => Self::Uint,
            'f' => Self::Fixed,
            's' => Self::Str(null),
            'o' => Self::Object(null),
            'n' => Self::NewId,
            'a' => Self::Array,
            'h' => Self::Fd,
            _ => return None,
        };
        Some(typ)
    }

    /// Whether this argument travels in the side channel rather than the payload
    pub fn is_fd(self) -> bool {
        self == Self::Fd
    }
}

/// Value of a message argument
///
/// `Id` is the representation of object references: raw `u32` on the wire, or the
/// handles of the connection. `Fd` is the file descriptor type, borrowed when sending
/// and owned once received.
#[derive(Debug, Clone)]
#[allow(clippy::box_collection)]
pub enum Argument<Id, Fd> {
    /// Signed integer
    Int(i32),
    /// Unsigned integer
    Uint(u32),
    /// Fixed point number in its raw wire form, see [`fixed_to_f64`] and [`fixed_from_f64`]
    Fixed(i32),
    /// String, `None` for a null string
    ///
    /// Boxed, like arrays, to keep the enum small.
    Str(Option<Box<CString>>),
    /// Object reference, the null id for a null object
    Object(Id),
    /// Object created by the message
    NewId(Id),
    /// Byte array
    Array(Box<Vec<u8>>),
    /// File descriptor
    Fd(Fd),
}

impl<Id, Fd> Argument<Id, Fd> {
    /// Kind of this argument
    ///
    /// Nullable kinds are reported as [`AllowNull::Yes`], compare them with
    /// [`ArgumentType::same_kind()`].
    pub fn arg_type(&self) -> ArgumentType {
        match self {
            Self::Int(_) => ArgumentType::Int,
            Self::Uint(_) => ArgumentType::Uint,
            Self::Fixed(_) => ArgumentType::Fixed,
            Self::Str(_) => ArgumentType::Str(AllowNull::Yes),
            Self::Object(_) => ArgumentType::Object(AllowNull::Yes),
            Self::NewId(_) => ArgumentType::NewId,
            Self::Array(_) => ArgumentType::Array,
            Self::Fd(_) => ArgumentType::Fd,
        }
    }

    fn map_fd<T>(self, f: &mut impl FnMut(Fd) -> T) -> Argument<Id, T> {
        match self {
            Self::Int(v) => Argument::Int(v),
            Self::Uint(v) => Argument::Uint(v),
            Self::Fixed(v) => Argument::Fixed(v),
            Self::Str(s) => Argument::Str(s),
            Self::Object(id) => Argument::Object(id),
            Self::NewId(id) => Argument::NewId(id),
            Self::Array(a) => Argument::Array(a),
            Self::Fd(fd) => Argument::Fd(f(fd)),
        }
    }
}

// Fds compare by their raw value
impl<Id: PartialEq, Fd: AsRawFd> PartialEq for Argument<Id, Fd> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) | (Self::Fixed(a), Self::Fixed(b)) => a == b,
            (Self::Uint(a), Self::Uint(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Object(a), Self::Object(b)) | (Self::NewId(a), Self::NewId(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Fd(a), Self::Fd(b)) => a.as_raw_fd() == b.as_raw_fd(),
            _ => false,
        }
    }
}

impl<Id: Eq, Fd: AsRawFd> Eq for Argument<Id, Fd> {}

impl<Id: fmt::Display, Fd: AsRawFd> fmt::Display for Argument<Id, Fd> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => v.fmt(f),
            Self::Uint(v) => v.fmt(f),
            Self::Fixed(raw) => write!(f, "{:.4}", fixed_to_f64(*raw)),
            Self::Str(Some(s)) => write!(f, "{:?}", s.to_string_lossy()),
            Self::Str(None) => f.write_str("nil"),
            Self::Object(id) | Self::NewId(id) => id.fmt(f),
            Self::Array(bytes) => write!(f, "array[{}]", bytes.len()),
            Self::Fd(fd) => write!(f, "fd {}", fd.as_raw_fd()),
        }
    }
}

/// Convert a raw 24.8 fixed point value to a float
#[inline]
pub fn fixed_to_f64(raw: i32) -> f64 {
    f64::from(raw) / 256.0
}

/// Convert a float to the raw 24.8 fixed point representation
///
/// The value is rounded to the nearest 1/256th and saturates at the bounds of the format.
#[inline]
pub fn fixed_from_f64(value: f64) -> i32 {
    (value * 256.0).round() as i32
}

/// Static description of an interface
///
/// These tables are normally generated from the protocol XML files. Requests and events
/// are indexed by their opcode.
#[derive(Debug)]
pub struct Interface {
    /// Name, as used by `wl_registry` and in error reports
    pub name: &'static str,
    /// Highest version described by this table
    pub version: u32,
    /// Messages sent by clients
    pub requests: &'static [MessageDesc],
    /// Messages sent by servers
    pub events: &'static [MessageDesc],
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Static description of a request or an event
#[derive(Copy, Clone, Debug)]
pub struct MessageDesc {
    /// Name of the message
    pub name: &'static str,
    /// Argument kinds, in order
    pub signature: &'static [ArgumentType],
    /// Interface version that introduced the message
    pub since: u32,
    /// Whether sending the message destroys its target
    pub is_destructor: bool,
    /// Interface of the object created by the `new_id` argument
    ///
    /// `None` either when the message creates nothing, or when it is generic and the
    /// interface name and version travel as arguments before the id.
    pub child_interface: Option<&'static Interface>,
    /// Expected interfaces of the object arguments, in order, when known
    pub arg_interfaces: &'static [&'static Interface],
}

/// Interface of objects whose real interface is not known to the connection
pub static ANONYMOUS_INTERFACE: Interface =
    Interface { name: "<anonymous>", version: 0, requests: &[], events: &[] };

/// What the connection knows about a live object
#[derive(Copy, Clone, Debug)]
pub struct ObjectInfo {
    /// Protocol id
    pub id: u32,
    /// Interface of the object
    pub interface: &'static Interface,
    /// Version the object was created with
    pub version: u32,
}

/// Fatal error reported by the server through `wl_display.error`
///
/// Once such an error is posted, the server closes the connection.
#[derive(Clone, Debug, thiserror::Error)]
#[error("Protocol error {code} on object {object_interface}@{object_id}: {message}")]
pub struct ProtocolError {
    /// Error code, from the `error` enum of the object's interface
    pub code: u32,
    /// Id of the faulty object
    pub object_id: u32,
    /// Interface of the faulty object
    pub object_interface: String,
    /// Human readable description
    pub message: String,
}

/// Arguments stored inline in a [`Message`] before spilling to the heap
pub const INLINE_ARGS: usize = 4;

/// A request or an event, addressed to an object
#[derive(Clone, Debug)]
pub struct Message<Id, Fd> {
    /// Target of a request, or emitter of an event
    pub sender_id: Id,
    /// Index of the message in the interface table
    pub opcode: u16,
    /// Arguments, matching the signature of the message
    pub args: smallvec::SmallVec<[Argument<Id, Fd>; INLINE_ARGS]>,
}

impl<Id, Fd> Message<Id, Fd> {
    /// Convert the file descriptors of the message, leaving the other arguments untouched
    pub fn map_fd<T>(self, mut f: impl FnMut(Fd) -> T) -> Message<Id, T> {
        let Message { sender_id, opcode, args } = self;
        let args = args.into_iter().map(|arg| arg.map_fd(&mut f)).collect();
        Message { sender_id, opcode, args }
    }
}

impl<Id: PartialEq, Fd: AsRawFd> PartialEq for Message<Id, Fd> {
    fn eq(&self, other: &Self) -> bool {
        (&self.sender_id, self.opcode, &self.args) == (&other.sender_id, other.opcode, &other.args)
    }
}

impl<Id: Eq, Fd: AsRawFd> Eq for Message<Id, Fd> {}

/// Whether two tables describe the same interface
///
/// Tables are compared by name when they are distinct statics, as several copies of the
/// same interface may be linked in.
#[inline]
pub fn same_interface(a: &'static Interface, b: &'static Interface) -> bool {
    std::ptr::eq(a, b) || a.name == b.name
}

// an anonymous interface on either side passes the check
#[inline]
pub(crate) fn accepts_interface(expected: &'static Interface, found: &'static Interface) -> bool {
    same_interface(expected, found)
        || same_interface(expected, &ANONYMOUS_INTERFACE)
        || same_interface(found, &ANONYMOUS_INTERFACE)
}

pub(crate) fn args_match_signature<Id, Fd>(
    signature: &[ArgumentType],
    args: &[Argument<Id, Fd>],
) -> bool {
    signature.len() == args.len()
        && signature.iter().zip(args).all(|(typ, arg)| arg.arg_type().same_kind(*typ))
}
