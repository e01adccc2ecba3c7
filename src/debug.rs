//! Protocol trace printed on stderr when `WAYLAND_DEBUG` is set

use std::{
    fmt,
    os::unix::io::AsRawFd,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{connection::Side, protocol::Argument};

/// Whether `WAYLAND_DEBUG` asks for the messages of `side` to be traced
///
/// The variable either holds `1`, tracing both sides, or the name of a single side.
pub fn has_debug_env(side: Side) -> bool {
    std::env::var_os("WAYLAND_DEBUG").is_some_and(|value| value == "1" || value == side.name())
}

/// Trace a message received from the peer, as `[sec.usec] <- interface@id.name(args)`
pub fn print_dispatched_message<Id: fmt::Display, Fd: AsRawFd>(
    interface: &str,
    id: u32,
    msg_name: &str,
    args: &[Argument<Id, Fd>],
    discarded: bool,
) {
    trace(if discarded { "[discarded] <-" } else { "<-" }, interface, id, msg_name, args);
}

/// Trace a message sent to the peer, as `[sec.usec] -> interface@id.name(args)`
pub fn print_send_message<Id: fmt::Display, Fd: AsRawFd>(
    interface: &str,
    id: u32,
    msg_name: &str,
    args: &[Argument<Id, Fd>],
) {
    trace("->", interface, id, msg_name, args);
}

fn trace<Id: fmt::Display, Fd: AsRawFd>(
    direction: &str,
    interface: &str,
    id: u32,
    msg_name: &str,
    args: &[Argument<Id, Fd>],
) {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    eprintln!(
        "[{}.{:06}] {direction} {interface}@{id}.{msg_name}({})",
        now.as_secs(),
        now.subsec_micros(),
        ArgList(args)
    );
}

/// Comma separated rendering of a list of arguments
pub(crate) struct ArgList<'a, T>(pub &'a [T]);

impl<T: fmt::Display> fmt::Display for ArgList<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, item) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            item.fmt(f)?;
        }
        Ok(())
    }
}
