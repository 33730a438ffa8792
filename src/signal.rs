//! Wire types for the signaling transport and the command channel
//!
//! Signaling messages travel as JSON text frames on the WebSocket.
//! Command envelopes travel as JSON text frames on the `cmd` data channel.
//! Both are flat structs rather than tagged enums so that a frame with an
//! unrecognized `type` still decodes and can be answered in-band.

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// A signaling frame: offer/answer/candidate/error/bye.
///
/// Optional fields are omitted on the wire when unset, matching the
/// envelope the mobile client expects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<RTCIceCandidateInit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SignalMessage {
    pub fn answer(sdp: String) -> Self {
        Self {
            kind: "answer".into(),
            sdp: Some(sdp),
            ..Default::default()
        }
    }

    pub fn candidate(init: RTCIceCandidateInit) -> Self {
        Self {
            kind: "candidate".into(),
            candidate: Some(init),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: "error".into(),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn bye() -> Self {
        Self {
            kind: "bye".into(),
            ..Default::default()
        }
    }
}

/// A command envelope on the `cmd` data channel.
///
/// `bin` carries base64 payloads (binary echo replies); `text` carries
/// everything else.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin: Option<String>,
}

impl CommandEnvelope {
    pub fn text(kind: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn bin(kind: impl Into<String>, bin: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            bin: Some(bin.into()),
            ..Default::default()
        }
    }
}
