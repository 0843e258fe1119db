//! Property-based tests using proptest
//!
//! These tests check the codec and settings invariants across randomly
//! generated messages and option sequences.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use mutator_client::core::codec::{MessageCodec, MessageType};
use mutator_client::protocol::message::{
    AuthRequest, InitializationRequest, InstanceRequest, LaunchData, MutatedPush,
    MutatorRequest, Request, ResolvedAddresses, ServerMessage, SessionCreatedPush, StatusReply,
};
use mutator_client::{MapperData, MutatorOption, ProtocolError, SettingsBuilder, VmType};
use proptest::prelude::*;

fn vm_type() -> impl Strategy<Value = VmType> {
    prop_oneof![Just(VmType::None), Just(VmType::Light), Just(VmType::Heavy)]
}

fn option() -> impl Strategy<Value = MutatorOption> {
    prop_oneof![
        any::<bool>().prop_map(MutatorOption::Shuffle),
        any::<bool>().prop_map(MutatorOption::BlockAsObject),
        any::<bool>().prop_map(MutatorOption::BlockShuffle),
        any::<bool>().prop_map(MutatorOption::ObfuscateRtti),
        any::<bool>().prop_map(MutatorOption::Partition),
        any::<bool>().prop_map(MutatorOption::SectionRandomization),
        any::<u32>().prop_map(MutatorOption::MinMutationLength),
        any::<u32>().prop_map(MutatorOption::MaxMutationLength),
        vm_type().prop_map(MutatorOption::Vm),
    ]
}

fn resolved() -> impl Strategy<Value = ResolvedAddresses> {
    (
        prop::collection::vec(any::<u64>(), 0..4),
        prop::collection::vec(("[a-z]{1,8}\\.dll", "[A-Za-z]{1,12}", any::<u64>()), 0..6),
    )
        .prop_map(|(bases, imports)| {
            let mut resolved = ResolvedAddresses {
                bases,
                ..ResolvedAddresses::default()
            };
            for (module, function, address) in imports {
                resolved.resolve(&module, &function, address);
            }
            resolved
        })
}

fn request() -> impl Strategy<Value = Request> {
    prop_oneof![
        ".{0,64}".prop_map(|auth_token| Request::Auth(AuthRequest { auth_token })),
        (
            prop::collection::vec(option(), 0..12),
            prop::collection::vec(any::<u8>(), 0..512),
            prop::collection::vec(any::<u8>(), 0..128),
            prop::option::of(prop::collection::vec(any::<u8>(), 0..256)),
        )
            .prop_map(|(options, binary, symbols, protected_binary)| {
                let mut builder = SettingsBuilder::new();
                for option in options {
                    builder.set_option(option);
                }
                Request::Init(InitializationRequest {
                    settings: builder.finalize(),
                    binary,
                    symbols,
                    protected_binary,
                })
            }),
        (any::<u32>(), any::<bool>()).prop_map(|(unique_key, mapper)| {
            Request::CreateInstance(InstanceRequest { unique_key, mapper })
        }),
        (any::<u32>(), resolved()).prop_map(|(unique_key, resolved)| {
            Request::Mutate(MutatorRequest {
                unique_key,
                resolved,
            })
        }),
    ]
}

fn server_message() -> impl Strategy<Value = ServerMessage> {
    prop_oneof![
        any::<u32>().prop_map(|status| ServerMessage::Auth(StatusReply { status })),
        any::<u32>().prop_map(|status| ServerMessage::Init(StatusReply { status })),
        (any::<u32>(), any::<u32>(), prop::option::of(resolved())).prop_map(
            |(session_id, status, imports)| {
                ServerMessage::SessionCreated(SessionCreatedPush {
                    session_id,
                    status,
                    mapper_data: imports.map(|r| MapperData { imports: r.imports }),
                })
            }
        ),
        (
            any::<u32>(),
            any::<u32>(),
            prop::collection::vec(prop::collection::vec(any::<u8>(), 0..256), 0..4),
            prop::option::of((any::<u64>(), prop::collection::vec(any::<u64>(), 0..4))),
        )
            .prop_map(|(session_id, status, binaries, launch)| {
                ServerMessage::Mutated(MutatedPush {
                    session_id,
                    status,
                    binaries,
                    launch_data: launch.map(|(entry_point, init_routines)| LaunchData {
                        entry_point,
                        init_routines,
                    }),
                })
            }),
    ]
}

// Property: every request survives encode then decode
proptest! {
    #[test]
    fn prop_request_roundtrip(request in request()) {
        let codec = MessageCodec::default();
        let frame = request.encode(&codec).expect("encode");

        prop_assert_eq!(frame[0], request.message_type().as_byte());
        prop_assert_eq!(Request::decode(&codec, &frame).expect("decode"), request);
    }
}

// Property: every server message survives encode then decode
proptest! {
    #[test]
    fn prop_server_message_roundtrip(message in server_message()) {
        let codec = MessageCodec::default();
        let frame = message.encode(&codec).expect("encode");

        prop_assert_eq!(ServerMessage::decode(&codec, &frame).expect("decode"), message);
    }
}

// Property: discriminators outside 0..=4 are decode errors, never panics
proptest! {
    #[test]
    fn prop_unknown_discriminator_rejected(
        kind in 5u8..=255,
        body in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let codec = MessageCodec::default();
        let mut frame = vec![kind];
        frame.extend(body);

        prop_assert!(MessageType::from_byte(kind).is_none());
        prop_assert!(matches!(
            ServerMessage::decode(&codec, &frame),
            Err(ProtocolError::Decode(_))
        ));
    }
}

// Property: arbitrary bytes never panic the decoder
proptest! {
    #[test]
    fn prop_garbage_never_panics(frame in prop::collection::vec(any::<u8>(), 0..512)) {
        let codec = MessageCodec::default();
        let _ = ServerMessage::decode(&codec, &frame);
        let _ = Request::decode(&codec, &frame);
    }
}

// Property: the snapshot holds the last write per key and ignores later writes
proptest! {
    #[test]
    fn prop_settings_last_write_wins(
        first in any::<u32>(),
        second in any::<u32>(),
        shuffle in any::<bool>(),
        vm in vm_type(),
    ) {
        let mut builder = SettingsBuilder::new();
        builder
            .set_option(MutatorOption::MaxMutationLength(first))
            .set_option(MutatorOption::Shuffle(!shuffle))
            .set_option(MutatorOption::MaxMutationLength(second))
            .set_option(MutatorOption::Shuffle(shuffle))
            .set_option(MutatorOption::Vm(vm));

        let mut later = builder.clone();
        let snapshot = builder.finalize();
        later.set_option(MutatorOption::MaxMutationLength(second.wrapping_add(1)));

        prop_assert_eq!(snapshot.max_mutation_length(), second);
        prop_assert_eq!(snapshot.shuffle(), shuffle);
        prop_assert_eq!(snapshot.vm_type(), vm);
        prop_assert_ne!(later.finalize().max_mutation_length(), snapshot.max_mutation_length());
    }
}
