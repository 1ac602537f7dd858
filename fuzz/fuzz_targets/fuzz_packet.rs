#![no_main]
use libfuzzer_sys::fuzz_target;
use utp_stream::utp::{decode_packet, encode_packet};

fuzz_target!(|data: &[u8]| {
    // decode_packet() should never panic on arbitrary datagrams
    if let Ok(parsed) = decode_packet(data) {
        let payload = parsed.payload(data);
        let encoded = encode_packet(&parsed.header, parsed.selective_ack.as_ref(), payload);
        let _ = decode_packet(&encoded);
    }
});
