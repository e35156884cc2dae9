//! Signaling wire format
//!
//! Every message on the signaling topic is a JSON object:
//!
//! ```json
//! {"type": "offer", "from": "peer_a", "to": "peer_b", "data": {"sdp": "v=0..."}}
//! ```
//!
//! Presence heartbeats carry neither `to` nor `data`. ICE candidates use
//! `{"sdpMid", "sdpMLineIndex", "candidate"}` as their `data`.

use crate::peer_id::PeerId;
use serde::{Deserialize, Serialize};

/// Envelope `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Presence,
    Offer,
    Answer,
    Ice,
}

/// Trickled ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Media stream identification tag
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,

    /// Index of the m-line the candidate belongs to
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,

    /// Candidate attribute line
    pub candidate: String,
}

/// Typed envelope body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Presence,
    Offer { sdp: String, ice_restart: bool },
    Answer { sdp: String },
    Ice(IceCandidate),
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalPayload::Presence => SignalKind::Presence,
            SignalPayload::Offer { .. } => SignalKind::Offer,
            SignalPayload::Answer { .. } => SignalKind::Answer,
            SignalPayload::Ice(_) => SignalKind::Ice,
        }
    }
}

/// Reasons an inbound envelope is rejected
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("missing field `{0}` for {1:?} envelope")]
    MissingField(&'static str, SignalKind),

    #[error("invalid data for {0:?} envelope: {1}")]
    InvalidData(SignalKind, serde_json::Error),
}

impl From<EnvelopeError> for crate::Error {
    fn from(err: EnvelopeError) -> Self {
        crate::Error::Serialization(err.to_string())
    }
}

/// A decoded signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingEnvelope {
    pub from: PeerId,
    /// Recipient; always `None` for presence
    pub to: Option<PeerId>,
    pub payload: SignalPayload,
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: SignalKind,
    from: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize)]
struct SdpData {
    sdp: String,
    #[serde(rename = "iceRestart", default, skip_serializing_if = "is_false")]
    ice_restart: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl SignalingEnvelope {
    /// Heartbeat announcing `from` is alive
    pub fn presence(from: PeerId) -> Self {
        Self {
            from,
            to: None,
            payload: SignalPayload::Presence,
        }
    }

    /// Directed message; presence payloads drop the recipient
    pub fn new(from: PeerId, to: PeerId, payload: SignalPayload) -> Self {
        let to = match payload {
            SignalPayload::Presence => None,
            _ => Some(to),
        };
        Self { from, to, payload }
    }

    pub fn kind(&self) -> SignalKind {
        self.payload.kind()
    }

    /// Whether this envelope is meant for `peer_id`
    pub fn is_addressed_to(&self, peer_id: &PeerId) -> bool {
        self.to.as_ref() == Some(peer_id)
    }

    pub fn to_json(&self) -> crate::Result<String> {
        let data = match &self.payload {
            SignalPayload::Presence => None,
            SignalPayload::Offer { sdp, ice_restart } => Some(serde_json::to_value(SdpData {
                sdp: sdp.clone(),
                ice_restart: *ice_restart,
            })?),
            SignalPayload::Answer { sdp } => Some(serde_json::to_value(SdpData {
                sdp: sdp.clone(),
                ice_restart: false,
            })?),
            SignalPayload::Ice(candidate) => Some(serde_json::to_value(candidate)?),
        };

        let wire = WireEnvelope {
            kind: self.kind(),
            from: self.from.clone(),
            to: self.to.clone(),
            data,
        };
        Ok(serde_json::to_string(&wire)?)
    }

    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        self.to_json().map(String::into_bytes)
    }

    /// Decode an envelope, checking the fields its type requires
    pub fn from_slice(bytes: &[u8]) -> std::result::Result<Self, EnvelopeError> {
        let wire: WireEnvelope = serde_json::from_slice(bytes)?;
        let kind = wire.kind;

        if kind == SignalKind::Presence {
            return Ok(Self::presence(wire.from));
        }

        let to = wire.to.ok_or(EnvelopeError::MissingField("to", kind))?;
        let data = wire.data.ok_or(EnvelopeError::MissingField("data", kind))?;

        let payload = match kind {
            SignalKind::Offer => {
                let sdp: SdpData = serde_json::from_value(data)
                    .map_err(|e| EnvelopeError::InvalidData(kind, e))?;
                SignalPayload::Offer {
                    sdp: sdp.sdp,
                    ice_restart: sdp.ice_restart,
                }
            }
            SignalKind::Answer => {
                let sdp: SdpData = serde_json::from_value(data)
                    .map_err(|e| EnvelopeError::InvalidData(kind, e))?;
                SignalPayload::Answer { sdp: sdp.sdp }
            }
            SignalKind::Ice => SignalPayload::Ice(
                serde_json::from_value(data).map_err(|e| EnvelopeError::InvalidData(kind, e))?,
            ),
            SignalKind::Presence => SignalPayload::Presence,
        };

        Ok(Self {
            from: wire.from,
            to: Some(to),
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_presence_has_no_to_or_data() {
        let envelope = SignalingEnvelope::presence(PeerId::new("peer_a"));
        let value: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "presence", "from": "peer_a"}));
    }

    #[test]
    fn test_offer_wire_format() {
        let envelope = SignalingEnvelope::new(
            PeerId::new("peer_a"),
            PeerId::new("peer_b"),
            SignalPayload::Offer {
                sdp: "v=0".to_string(),
                ice_restart: false,
            },
        );
        let value: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "offer", "from": "peer_a", "to": "peer_b", "data": {"sdp": "v=0"}})
        );
    }

    #[test]
    fn test_restart_offer_carries_flag() {
        let envelope = SignalingEnvelope::new(
            PeerId::new("peer_a"),
            PeerId::new("peer_b"),
            SignalPayload::Offer {
                sdp: "v=0".to_string(),
                ice_restart: true,
            },
        );
        let json = envelope.to_json().unwrap();
        assert!(json.contains("\"iceRestart\":true"));
        assert_eq!(SignalingEnvelope::from_slice(json.as_bytes()).unwrap(), envelope);
    }

    #[test]
    fn test_parse_ice_candidate() {
        let raw = br#"{"type":"ice","from":"peer_b","to":"peer_a",
            "data":{"sdpMid":"0","sdpMLineIndex":0,"candidate":"candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host"}}"#;
        let envelope = SignalingEnvelope::from_slice(raw).unwrap();
        assert_eq!(envelope.kind(), SignalKind::Ice);
        assert!(envelope.is_addressed_to(&PeerId::new("peer_a")));
        match envelope.payload {
            SignalPayload::Ice(candidate) => {
                assert_eq!(candidate.sdp_mid, "0");
                assert_eq!(candidate.sdp_mline_index, 0);
                assert!(candidate.candidate.starts_with("candidate:1"));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let raw = br#"{"type":"answer","from":"b","to":"a","data":{"sdp":"v=0","extra":1},"ts":5}"#;
        let envelope = SignalingEnvelope::from_slice(raw).unwrap();
        assert_eq!(
            envelope.payload,
            SignalPayload::Answer {
                sdp: "v=0".to_string()
            }
        );
    }

    #[test]
    fn test_malformed_envelopes_rejected() {
        assert!(matches!(
            SignalingEnvelope::from_slice(b"not json"),
            Err(EnvelopeError::InvalidJson(_))
        ));
        assert!(matches!(
            SignalingEnvelope::from_slice(br#"{"type":"offer","from":"a","data":{"sdp":"x"}}"#),
            Err(EnvelopeError::MissingField("to", SignalKind::Offer))
        ));
        assert!(matches!(
            SignalingEnvelope::from_slice(br#"{"type":"answer","from":"a","to":"b"}"#),
            Err(EnvelopeError::MissingField("data", SignalKind::Answer))
        ));
        assert!(matches!(
            SignalingEnvelope::from_slice(br#"{"type":"ice","from":"a","to":"b","data":{"candidate":"c"}}"#),
            Err(EnvelopeError::InvalidData(SignalKind::Ice, _))
        ));
        assert!(SignalingEnvelope::from_slice(br#"{"type":"bye","from":"a"}"#).is_err());
    }
}
