#![no_main]

use libfuzzer_sys::fuzz_target;
use mutator_client::core::codec::MessageCodec;
use mutator_client::protocol::message::ServerMessage;

fuzz_target!(|data: &[u8]| {
    // inbound frames come straight off the socket; decoding must never panic
    let _ = ServerMessage::decode(&MessageCodec::default(), data);
});
