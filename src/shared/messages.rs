//! Wire protocol: command envelopes, responses and the binary upload frame.
//!
//! Everything on the wire is JSON with a `{command, username, data}` shape;
//! responses mirror it without the username. The one non-JSON frame is the
//! audio upload: `"<filename>$<raw bytes>"`.

use crate::game::resources::ResourceKind;
use crate::game::technology::Technology;
use crate::game::units::{NeuronKind, PotentialKind};
use crate::shared::error::GameError;
use crate::shared::snapshot::Snapshot;
use crate::util::Position;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Inbound message: every command a client sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub command: String,
    pub username: String,
    pub data: Value,
}

impl Envelope {
    pub fn new(command: &str, username: &str, data: Value) -> Self {
        Self {
            command: command.to_string(),
            username: username.to_string(),
            data,
        }
    }

    /// Parses and validates an inbound frame; all three fields are required.
    pub fn parse(text: &str) -> Result<Self, GameError> {
        serde_json::from_str(text)
            .map_err(|e| GameError::ProtocolError(format!("invalid envelope: {}", e)))
    }
}

/// Outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub command: String,
    pub data: Value,
}

impl Response {
    pub fn new(command: &str, data: Value) -> Self {
        Self {
            command: command.to_string(),
            data,
        }
    }

    pub fn print_msg(msg: &str) -> Self {
        Self::new("print_msg", json!({ "msg": msg }))
    }

    pub fn kill(msg: &str) -> Self {
        Self::new("kill", json!({ "msg": msg }))
    }

    pub fn select_mode() -> Self {
        Self::new("select_mode", Value::Null)
    }

    pub fn select_audio() -> Self {
        Self::new("select_audio", Value::Null)
    }

    pub fn snapshot(snapshot: &Snapshot) -> Self {
        Self::new(
            "snapshot",
            serde_json::to_value(snapshot).expect("snapshots always serialize"),
        )
    }

    pub fn game_over(msg: &str, statistics: Value) -> Self {
        Self::new("game_over", json!({ "msg": msg, "statistics": statistics }))
    }
}

/// Game mode codes as they travel over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameMode {
    SinglePlayer,
    MultiPlayer,
    MultiPlayerClient,
    Observer,
    Tutorial,
    AiGame,
}

impl GameMode {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(GameMode::SinglePlayer),
            1 => Some(GameMode::MultiPlayer),
            2 => Some(GameMode::MultiPlayerClient),
            3 => Some(GameMode::Observer),
            4 => Some(GameMode::Tutorial),
            6 => Some(GameMode::AiGame),
            _ => None,
        }
    }

    pub fn code(self) -> u64 {
        match self {
            GameMode::SinglePlayer => 0,
            GameMode::MultiPlayer => 1,
            GameMode::MultiPlayerClient => 2,
            GameMode::Observer => 3,
            GameMode::Tutorial => 4,
            GameMode::AiGame => 6,
        }
    }
}

/// Splits a binary upload frame into filename and payload.
pub fn parse_binary_upload(frame: &[u8]) -> Result<(String, &[u8]), GameError> {
    let split = frame
        .iter()
        .position(|&b| b == b'$')
        .ok_or_else(|| GameError::ProtocolError("upload frame without separator".into()))?;
    let filename = std::str::from_utf8(&frame[..split])
        .map_err(|_| GameError::ProtocolError("upload filename is not utf-8".into()))?;
    if filename.is_empty() || filename.contains('/') || filename.contains("..") {
        return Err(GameError::ProtocolError("bad upload filename".into()));
    }
    Ok((filename.to_string(), &frame[split + 1..]))
}

// ---- data field helpers ----

pub fn position_field(data: &Value, key: &str) -> Option<Position> {
    let arr = data.get(key)?.as_array()?;
    Some((arr.first()?.as_i64()? as i32, arr.get(1)?.as_i64()? as i32))
}

pub fn resource_field(data: &Value, key: &str) -> Option<ResourceKind> {
    let name = data.get(key)?.as_str()?;
    ResourceKind::ALL.into_iter().find(|k| k.name() == name)
}

pub fn technology_field(data: &Value, key: &str) -> Option<Technology> {
    let name = data.get(key)?.as_str()?;
    Technology::ALL.into_iter().find(|t| t.name() == name)
}

pub fn neuron_kind_field(data: &Value, key: &str) -> Option<NeuronKind> {
    match data.get(key)?.as_str()? {
        "nucleus" => Some(NeuronKind::Nucleus),
        "synapse" => Some(NeuronKind::Synapse),
        "activated-neuron" => Some(NeuronKind::ActivatedNeuron),
        _ => None,
    }
}

pub fn potential_kind_field(data: &Value, key: &str) -> Option<PotentialKind> {
    match data.get(key)?.as_str()? {
        "epsp" => Some(PotentialKind::Epsp),
        "ipsp" => Some(PotentialKind::Ipsp),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let envelope = Envelope::new("add_iron", "alice", json!({ "resource": "oxygen" }));
        let text = serde_json::to_string(&envelope).unwrap();
        assert_eq!(Envelope::parse(&text).unwrap(), envelope);
    }

    #[test]
    fn test_envelope_missing_field_is_protocol_error() {
        let err = Envelope::parse(r#"{"command": "ready"}"#).unwrap_err();
        assert!(matches!(err, GameError::ProtocolError(_)));
    }

    #[test]
    fn test_envelope_garbage_is_protocol_error() {
        assert!(matches!(
            Envelope::parse("not json at all"),
            Err(GameError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_binary_upload_split() {
        let frame = b"song.mp3$\x00\x01\x02";
        let (name, payload) = parse_binary_upload(frame).unwrap();
        assert_eq!(name, "song.mp3");
        assert_eq!(payload, &[0, 1, 2]);
    }

    #[test]
    fn test_binary_upload_rejects_traversal() {
        assert!(parse_binary_upload(b"../evil$x").is_err());
        assert!(parse_binary_upload(b"no-separator").is_err());
    }

    #[test]
    fn test_mode_codes_round_trip() {
        for mode in [
            GameMode::SinglePlayer,
            GameMode::MultiPlayer,
            GameMode::MultiPlayerClient,
            GameMode::Observer,
            GameMode::Tutorial,
            GameMode::AiGame,
        ] {
            assert_eq!(GameMode::from_code(mode.code()), Some(mode));
        }
        assert_eq!(GameMode::from_code(99), None);
    }

    #[test]
    fn test_data_field_helpers() {
        let data = json!({
            "pos": [4, 7],
            "resource": "potassium",
            "technology": "swarm attack",
            "unit": "synapse",
            "potential": "ipsp",
        });
        assert_eq!(position_field(&data, "pos"), Some((4, 7)));
        assert_eq!(resource_field(&data, "resource"), Some(ResourceKind::Potassium));
        assert_eq!(technology_field(&data, "technology"), Some(Technology::Swarm));
        assert_eq!(neuron_kind_field(&data, "unit"), Some(NeuronKind::Synapse));
        assert_eq!(potential_kind_field(&data, "potential"), Some(PotentialKind::Ipsp));
    }
}
