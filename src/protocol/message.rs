//! Protocol messages.
//!
//! [`Request`] covers everything the client sends, [`ServerMessage`] everything
//! the service sends. Both share the discriminator space of [`MessageType`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::codec::{MessageCodec, MessageType};
use crate::error::Result;
use crate::protocol::callback::CallbackPayload;
use crate::protocol::settings::MutatorSettings;

/// Status value meaning success in every reply and push
pub const STATUS_OK: u32 = 0;

/// Functions imported from one module, symbol name → address.
///
/// In a [`MapperData`] the addresses are placeholders; in a mutation request
/// they hold the resolved addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedModule {
    pub functions: BTreeMap<String, u64>,
}

/// Client-resolved addresses a mapper session needs before mutation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedAddresses {
    /// Allocation bases reserved in the target process
    pub bases: Vec<u64>,
    /// Module name → resolved imports
    pub imports: BTreeMap<String, ImportedModule>,
}

impl ResolvedAddresses {
    pub fn is_empty(&self) -> bool {
        self.bases.is_empty() && self.imports.is_empty()
    }

    /// Record one resolved import
    pub fn resolve(&mut self, module: &str, function: &str, address: u64) -> &mut Self {
        self.imports
            .entry(module.to_string())
            .or_default()
            .functions
            .insert(function.to_string(), address);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub auth_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializationRequest {
    pub settings: MutatorSettings,
    pub binary: Vec<u8>,
    pub symbols: Vec<u8>,
    pub protected_binary: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRequest {
    pub unique_key: u32,
    pub mapper: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutatorRequest {
    pub unique_key: u32,
    pub resolved: ResolvedAddresses,
}

/// Handler result returned for an out-of-band callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackReply {
    pub call_id: u32,
    pub session_id: u32,
    pub payload: CallbackPayload,
}

/// Client → service messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Auth(AuthRequest),
    Init(InitializationRequest),
    CreateInstance(InstanceRequest),
    Mutate(MutatorRequest),
    CallbackResult(CallbackReply),
}

impl Request {
    pub fn message_type(&self) -> MessageType {
        match self {
            Request::Auth(_) => MessageType::Auth,
            Request::Init(_) => MessageType::Init,
            Request::CreateInstance(_) => MessageType::CreateInstance,
            Request::Mutate(_) => MessageType::Mutate,
            Request::CallbackResult(_) => MessageType::Callback,
        }
    }

    pub fn encode(&self, codec: &MessageCodec) -> Result<Bytes> {
        let kind = self.message_type();
        match self {
            Request::Auth(p) => codec.encode(kind, p),
            Request::Init(p) => codec.encode(kind, p),
            Request::CreateInstance(p) => codec.encode(kind, p),
            Request::Mutate(p) => codec.encode(kind, p),
            Request::CallbackResult(p) => codec.encode(kind, p),
        }
    }

    pub fn decode(codec: &MessageCodec, frame: &[u8]) -> Result<Self> {
        let (kind, _) = codec.split(frame)?;
        Ok(match kind {
            MessageType::Auth => Request::Auth(codec.decode(frame)?.1),
            MessageType::Init => Request::Init(codec.decode(frame)?.1),
            MessageType::CreateInstance => Request::CreateInstance(codec.decode(frame)?.1),
            MessageType::Mutate => Request::Mutate(codec.decode(frame)?.1),
            MessageType::Callback => Request::CallbackResult(codec.decode(frame)?.1),
        })
    }
}

/// Reply to a blocking request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    pub status: u32,
}

/// Imports the service needs resolved for a mapper session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapperData {
    pub imports: BTreeMap<String, ImportedModule>,
}

impl MapperData {
    /// Iterate `(module, function)` pairs in a stable order
    pub fn import_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.imports.iter().flat_map(|(module, imported)| {
            imported
                .functions
                .keys()
                .map(move |function| (module.as_str(), function.as_str()))
        })
    }
}

/// Launch metadata accompanying mutated output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchData {
    pub entry_point: u64,
    pub init_routines: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCreatedPush {
    pub session_id: u32,
    pub status: u32,
    pub mapper_data: Option<MapperData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutatedPush {
    pub session_id: u32,
    pub status: u32,
    pub binaries: Vec<Vec<u8>>,
    pub launch_data: Option<LaunchData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackPush {
    pub call_id: u32,
    pub session_id: u32,
    pub payload: CallbackPayload,
}

/// Service → client messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Auth(StatusReply),
    Init(StatusReply),
    SessionCreated(SessionCreatedPush),
    Mutated(MutatedPush),
    Callback(CallbackPush),
}

impl ServerMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ServerMessage::Auth(_) => MessageType::Auth,
            ServerMessage::Init(_) => MessageType::Init,
            ServerMessage::SessionCreated(_) => MessageType::CreateInstance,
            ServerMessage::Mutated(_) => MessageType::Mutate,
            ServerMessage::Callback(_) => MessageType::Callback,
        }
    }

    pub fn encode(&self, codec: &MessageCodec) -> Result<Bytes> {
        let kind = self.message_type();
        match self {
            ServerMessage::Auth(p) | ServerMessage::Init(p) => codec.encode(kind, p),
            ServerMessage::SessionCreated(p) => codec.encode(kind, p),
            ServerMessage::Mutated(p) => codec.encode(kind, p),
            ServerMessage::Callback(p) => codec.encode(kind, p),
        }
    }

    pub fn decode(codec: &MessageCodec, frame: &[u8]) -> Result<Self> {
        let (kind, _) = codec.split(frame)?;
        Ok(match kind {
            MessageType::Auth => ServerMessage::Auth(codec.decode(frame)?.1),
            MessageType::Init => ServerMessage::Init(codec.decode(frame)?.1),
            MessageType::CreateInstance => ServerMessage::SessionCreated(codec.decode(frame)?.1),
            MessageType::Mutate => ServerMessage::Mutated(codec.decode(frame)?.1),
            MessageType::Callback => ServerMessage::Callback(codec.decode(frame)?.1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use crate::protocol::callback::ExportRemap;
    use crate::protocol::settings::{MutatorOption, SettingsBuilder};

    #[test]
    fn request_frames_lead_with_their_type_byte() {
        let codec = MessageCodec::default();
        let auth = Request::Auth(AuthRequest {
            auth_token: "T1".to_string(),
        });
        let frame = auth.encode(&codec).expect("encode");
        assert_eq!(frame[0], 0);

        let create = Request::CreateInstance(InstanceRequest {
            unique_key: 42,
            mapper: true,
        });
        assert_eq!(create.encode(&codec).expect("encode")[0], 2);
    }

    #[test]
    fn init_request_roundtrip() {
        let codec = MessageCodec::default();
        let settings = SettingsBuilder::new()
            .with(MutatorOption::Shuffle(true))
            .with(MutatorOption::MaxMutationLength(50))
            .finalize();
        let request = Request::Init(InitializationRequest {
            settings,
            binary: vec![0x4D, 0x5A, 0x90],
            symbols: b"0001:00001000 main".to_vec(),
            protected_binary: None,
        });
        let frame = request.encode(&codec).expect("encode");
        assert_eq!(Request::decode(&codec, &frame).expect("decode"), request);
    }

    #[test]
    fn mutated_push_roundtrip_keeps_binary_order() {
        let codec = MessageCodec::default();
        let push = ServerMessage::Mutated(MutatedPush {
            session_id: 42,
            status: STATUS_OK,
            binaries: vec![vec![1, 2, 3], vec![], vec![9]],
            launch_data: Some(LaunchData {
                entry_point: 0x1000,
                init_routines: vec![0x1100],
            }),
        });
        let frame = push.encode(&codec).expect("encode");
        assert_eq!(ServerMessage::decode(&codec, &frame).expect("decode"), push);
    }

    #[test]
    fn callback_reply_uses_callback_type() {
        let codec = MessageCodec::default();
        let reply = Request::CallbackResult(CallbackReply {
            call_id: 5,
            session_id: 1,
            payload: CallbackPayload::ExportRemap(ExportRemap {
                export: "e".to_string(),
                original: 1,
                remapped: 2,
            }),
        });
        let frame = reply.encode(&codec).expect("encode");
        assert_eq!(frame[0], 4);
        assert_eq!(Request::decode(&codec, &frame).expect("decode"), reply);
    }

    #[test]
    fn mismatched_payload_is_a_decode_error() {
        let codec = MessageCodec::default();
        // a status reply body under the mutate discriminator
        let mut frame = vec![MessageType::Mutate.as_byte()];
        frame.extend_from_slice(&7u32.to_le_bytes());
        assert!(matches!(
            ServerMessage::decode(&codec, &frame),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn resolve_builds_nested_tables() {
        let mut resolved = ResolvedAddresses::default();
        assert!(resolved.is_empty());
        resolved
            .resolve("kernel32.dll", "VirtualAlloc", 0x1234)
            .resolve("kernel32.dll", "VirtualFree", 0x5678);
        resolved.bases.push(0x1000_0000);

        assert_eq!(resolved.imports["kernel32.dll"].functions.len(), 2);
        assert!(!resolved.is_empty());
    }

    #[test]
    fn import_pairs_flatten_in_order() {
        let mut data = MapperData::default();
        let mut user32 = ImportedModule::default();
        user32.functions.insert("MessageBoxA".to_string(), 0);
        let mut kernel32 = ImportedModule::default();
        kernel32.functions.insert("Sleep".to_string(), 0);
        kernel32.functions.insert("ExitProcess".to_string(), 0);
        data.imports.insert("user32.dll".to_string(), user32);
        data.imports.insert("kernel32.dll".to_string(), kernel32);

        let pairs: Vec<_> = data.import_pairs().collect();
        assert_eq!(
            pairs,
            vec![
                ("kernel32.dll", "ExitProcess"),
                ("kernel32.dll", "Sleep"),
                ("user32.dll", "MessageBoxA"),
            ]
        );
    }
}
