#![no_main]

use std::collections::VecDeque;
use std::os::unix::io::OwnedFd;

use libfuzzer_sys::fuzz_target;
use wayland_wire::protocol::{AllowNull, ArgumentType};
use wayland_wire::wire::parse_message;

fn get_arg_types(data: &[u8]) -> Vec<ArgumentType> {
    data.iter()
        .map(|b| match b & 0b111 {
            0 => ArgumentType::Int,
            1 => ArgumentType::Uint,
            2 => ArgumentType::Fixed,
            3 => ArgumentType::Str(if b & 0b1000 != 0 { AllowNull::Yes } else { AllowNull::No }),
            4 => ArgumentType::Object(if b & 0b1000 != 0 { AllowNull::Yes } else { AllowNull::No }),
            5 => ArgumentType::NewId,
            6 => ArgumentType::Array,
            _ => ArgumentType::Fd,
        })
        .collect()
}

fuzz_target!(|data: &[u8]| {
    if data.len() < 8 {
        return;
    }
    // 8 argument types, then the message
    let signature = get_arg_types(&data[..8]);
    let mut fds: VecDeque<OwnedFd> = VecDeque::new();
    let _ = parse_message(&data[8..], &signature, &mut fds);
    if let Ok(text) = std::str::from_utf8(&data[8..]) {
        let _ = wayland_wire::wire::parse_signature(text);
    }
});
