#![no_main]
use libfuzzer_sys::fuzz_target;
use tlsgrep::protocol::{LinkType, decode_segment};

fuzz_target!(|data: &[u8]| {
    for link_type in [LinkType::Ethernet, LinkType::RawIp, LinkType::LinuxSll] {
        let _ = decode_segment(data, link_type);
    }
});
