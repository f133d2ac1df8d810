// Wire codec: JSON envelopes plus the compact legacy form
//
// Envelope wire shape: {"type": "...", "transferId": "...", "payload": {...}}

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum encoded envelope size: 256 KB
pub const MAX_ENVELOPE_SIZE: usize = 256 * 1024;

/// Prefix of diagnostic strings that are never protocol traffic
pub const DIAGNOSTIC_PREFIX: &str = "TEST_";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Message too large: {0} bytes (max {max})", max = MAX_ENVELOPE_SIZE)]
    TooLarge(usize),
    #[error("Message is not valid UTF-8")]
    InvalidUtf8,
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Unrecognized message: {0}")]
    Unrecognized(String),
    #[error("Message has an empty transfer id")]
    EmptyTransferId,
}

/// Wire tag of each message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "TRANSFER_PERMISSION_REQUEST")]
    PermissionRequest,
    #[serde(rename = "TRANSFER_PERMISSION_RESPONSE")]
    PermissionResponse,
    #[serde(rename = "TRANSFER_REQUEST")]
    TransferRequest,
    #[serde(rename = "ADDRESS_RESPONSE")]
    AddressResponse,
    #[serde(rename = "TRANSFER_PACKAGE")]
    TransferPackage,
    #[serde(rename = "TRANSFER_COMPLETE")]
    TransferComplete,
    #[serde(rename = "TRANSFER_ERROR")]
    TransferError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub sender_name: String,
    pub token_type: String,
    pub token_name: String,
    pub token_preview: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResponse {
    pub approved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub token_type: String,
    pub token_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressResponse {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferPackage {
    pub offline_package: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferComplete {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_json: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferErrorPayload {
    pub error: String,
}

/// Typed payload of an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    PermissionRequest(PermissionRequest),
    PermissionResponse(PermissionResponse),
    TransferRequest(TransferRequest),
    AddressResponse(AddressResponse),
    TransferPackage(TransferPackage),
    TransferComplete(TransferComplete),
    TransferError(TransferErrorPayload),
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::PermissionRequest(_) => MessageType::PermissionRequest,
            MessageBody::PermissionResponse(_) => MessageType::PermissionResponse,
            MessageBody::TransferRequest(_) => MessageType::TransferRequest,
            MessageBody::AddressResponse(_) => MessageType::AddressResponse,
            MessageBody::TransferPackage(_) => MessageType::TransferPackage,
            MessageBody::TransferComplete(_) => MessageType::TransferComplete,
            MessageBody::TransferError(_) => MessageType::TransferError,
        }
    }
}

/// One protocol message for one transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct Envelope {
    pub transfer_id: String,
    pub body: MessageBody,
}

impl Envelope {
    pub fn new(transfer_id: &str, body: MessageBody) -> Self {
        Self {
            transfer_id: transfer_id.to_string(),
            body,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    pub fn permission_response(transfer_id: &str, approved: bool) -> Self {
        Self::new(
            transfer_id,
            MessageBody::PermissionResponse(PermissionResponse { approved }),
        )
    }

    pub fn error(transfer_id: &str, error: impl Into<String>) -> Self {
        Self::new(
            transfer_id,
            MessageBody::TransferError(TransferErrorPayload {
                error: error.into(),
            }),
        )
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    #[serde(rename = "type")]
    message_type: MessageType,
    transfer_id: String,
    payload: serde_json::Value,
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = String;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        fn payload<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, String> {
            serde_json::from_value(value).map_err(|e| e.to_string())
        }

        let body = match wire.message_type {
            MessageType::PermissionRequest => MessageBody::PermissionRequest(payload(wire.payload)?),
            MessageType::PermissionResponse => {
                MessageBody::PermissionResponse(payload(wire.payload)?)
            }
            MessageType::TransferRequest => MessageBody::TransferRequest(payload(wire.payload)?),
            MessageType::AddressResponse => MessageBody::AddressResponse(payload(wire.payload)?),
            MessageType::TransferPackage => MessageBody::TransferPackage(payload(wire.payload)?),
            MessageType::TransferComplete => MessageBody::TransferComplete(payload(wire.payload)?),
            MessageType::TransferError => MessageBody::TransferError(payload(wire.payload)?),
        };
        Ok(Envelope {
            transfer_id: wire.transfer_id,
            body,
        })
    }
}

impl From<Envelope> for WireEnvelope {
    fn from(envelope: Envelope) -> Self {
        let message_type = envelope.message_type();
        let payload = match envelope.body {
            MessageBody::PermissionRequest(p) => serde_json::to_value(p),
            MessageBody::PermissionResponse(p) => serde_json::to_value(p),
            MessageBody::TransferRequest(p) => serde_json::to_value(p),
            MessageBody::AddressResponse(p) => serde_json::to_value(p),
            MessageBody::TransferPackage(p) => serde_json::to_value(p),
            MessageBody::TransferComplete(p) => serde_json::to_value(p),
            MessageBody::TransferError(p) => serde_json::to_value(p),
        }
        // Plain structs of strings and bools always convert
        .unwrap_or(serde_json::Value::Null);
        WireEnvelope {
            message_type,
            transfer_id: envelope.transfer_id,
            payload,
        }
    }
}

/// Messages in the compact colon-prefixed form
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyMessage {
    Approved { transfer_id: String },
    Rejected { transfer_id: String },
    TransferRequest {
        transfer_id: String,
        token_type: String,
        token_id: String,
    },
    /// Recognized but carries nothing actionable
    DetailsRequest { transfer_id: String },
}

impl LegacyMessage {
    pub fn transfer_id(&self) -> &str {
        match self {
            LegacyMessage::Approved { transfer_id }
            | LegacyMessage::Rejected { transfer_id }
            | LegacyMessage::TransferRequest { transfer_id, .. }
            | LegacyMessage::DetailsRequest { transfer_id } => transfer_id,
        }
    }

    /// Equivalent envelope, if the message is actionable
    pub fn into_envelope(self) -> Option<Envelope> {
        match self {
            LegacyMessage::Approved { transfer_id } => {
                Some(Envelope::permission_response(&transfer_id, true))
            }
            LegacyMessage::Rejected { transfer_id } => {
                Some(Envelope::permission_response(&transfer_id, false))
            }
            LegacyMessage::TransferRequest {
                transfer_id,
                token_type,
                token_id,
            } => Some(Envelope::new(
                &transfer_id,
                MessageBody::TransferRequest(TransferRequest {
                    token_type,
                    token_id,
                }),
            )),
            LegacyMessage::DetailsRequest { .. } => None,
        }
    }

    fn parse(text: &str) -> Option<Result<Self, ProtocolError>> {
        let (tag, rest) = text.split_once(':')?;
        let message = match tag {
            "TFER_APR" => LegacyMessage::Approved {
                transfer_id: rest.to_string(),
            },
            "TFER_REJ" | "REJECT" => LegacyMessage::Rejected {
                transfer_id: rest.to_string(),
            },
            "TFER_DTL" => LegacyMessage::DetailsRequest {
                transfer_id: rest.to_string(),
            },
            "TFER_REQ" => {
                let mut parts = rest.splitn(3, '|');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(id), Some(token_type), Some(token_id)) => {
                        LegacyMessage::TransferRequest {
                            transfer_id: id.to_string(),
                            token_type: token_type.to_string(),
                            token_id: token_id.to_string(),
                        }
                    }
                    _ => {
                        return Some(Err(ProtocolError::Malformed(format!(
                            "compact transfer request needs 3 fields: {}",
                            text
                        ))))
                    }
                }
            }
            _ => return None,
        };
        if message.transfer_id().is_empty() {
            return Some(Err(ProtocolError::EmptyTransferId));
        }
        Some(Ok(message))
    }
}

/// A decoded inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Envelope(Envelope),
    Legacy(LegacyMessage),
    /// Diagnostic traffic; ignore
    Diagnostic,
}

/// Serialize an envelope to JSON bytes
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    if envelope.transfer_id.is_empty() {
        return Err(ProtocolError::EmptyTransferId);
    }
    let bytes =
        serde_json::to_vec(envelope).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if bytes.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::TooLarge(bytes.len()));
    }
    Ok(bytes)
}

/// Decode raw bytes received over the mesh
pub fn decode_inbound(bytes: &[u8]) -> Result<Inbound, ProtocolError> {
    if bytes.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::TooLarge(bytes.len()));
    }
    let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
    let text = text.trim();

    if text.starts_with(DIAGNOSTIC_PREFIX) {
        return Ok(Inbound::Diagnostic);
    }

    if text.starts_with('{') {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if envelope.transfer_id.is_empty() {
            return Err(ProtocolError::EmptyTransferId);
        }
        return Ok(Inbound::Envelope(envelope));
    }

    match LegacyMessage::parse(text) {
        Some(result) => result.map(Inbound::Legacy),
        None => Err(ProtocolError::Unrecognized(text.chars().take(32).collect())),
    }
}

/// Compact form of an envelope, for message types that have one
pub fn encode_compact(envelope: &Envelope) -> Option<String> {
    let id = &envelope.transfer_id;
    match &envelope.body {
        MessageBody::PermissionResponse(p) if p.approved => Some(format!("TFER_APR:{}", id)),
        MessageBody::PermissionResponse(_) => Some(format!("TFER_REJ:{}", id)),
        MessageBody::TransferRequest(r) => {
            Some(format!("TFER_REQ:{}|{}|{}", id, r.token_type, r.token_id))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_messages() -> Vec<Envelope> {
        vec![
            Envelope::new(
                "t1",
                MessageBody::PermissionRequest(PermissionRequest {
                    sender_name: "Alice".into(),
                    token_type: "ticket".into(),
                    token_name: "Concert".into(),
                    token_preview: "ticket: Concert".into(),
                }),
            ),
            Envelope::permission_response("t1", true),
            Envelope::new(
                "t1",
                MessageBody::TransferRequest(TransferRequest {
                    token_type: "ticket".into(),
                    token_id: "tok-9".into(),
                }),
            ),
            Envelope::new(
                "t1",
                MessageBody::AddressResponse(AddressResponse {
                    address: "addr".into(),
                }),
            ),
            Envelope::new(
                "t1",
                MessageBody::TransferPackage(TransferPackage {
                    offline_package: "pkg".into(),
                }),
            ),
            Envelope::new(
                "t1",
                MessageBody::TransferComplete(TransferComplete {
                    success: true,
                    token_json: Some("{\"id\":1}".into()),
                }),
            ),
            Envelope::error("t1", "Approval timeout"),
        ]
    }

    #[test]
    fn test_roundtrip_every_message_type() {
        for envelope in all_messages() {
            let bytes = encode_envelope(&envelope).expect("encode");
            let decoded = decode_inbound(&bytes).expect("decode");
            assert_eq!(decoded, Inbound::Envelope(envelope));
        }
    }

    #[test]
    fn test_wire_shape() {
        let bytes = encode_envelope(&Envelope::new(
            "abc",
            MessageBody::TransferRequest(TransferRequest {
                token_type: "ticket".into(),
                token_id: "tok-1".into(),
            }),
        ))
        .expect("encode");
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("json");

        assert_eq!(value["type"], "TRANSFER_REQUEST");
        assert_eq!(value["transferId"], "abc");
        assert_eq!(value["payload"]["tokenType"], "ticket");
        assert_eq!(value["payload"]["tokenId"], "tok-1");
    }

    #[test]
    fn test_complete_without_token_json() {
        let json = r#"{"type":"TRANSFER_COMPLETE","transferId":"x","payload":{"success":false}}"#;
        match decode_inbound(json.as_bytes()).expect("decode") {
            Inbound::Envelope(Envelope {
                body: MessageBody::TransferComplete(c),
                ..
            }) => {
                assert!(!c.success);
                assert_eq!(c.token_json, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_payload_must_match_type() {
        let json = r#"{"type":"ADDRESS_RESPONSE","transferId":"x","payload":{"approved":true}}"#;
        assert!(matches!(
            decode_inbound(json.as_bytes()),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let json = r#"{"type":"SOMETHING_ELSE","transferId":"x","payload":{}}"#;
        assert!(matches!(
            decode_inbound(json.as_bytes()),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_empty_transfer_id_rejected() {
        let json = r#"{"type":"TRANSFER_ERROR","transferId":"","payload":{"error":"x"}}"#;
        assert_eq!(
            decode_inbound(json.as_bytes()),
            Err(ProtocolError::EmptyTransferId)
        );
    }

    #[test]
    fn test_oversized_rejected() {
        let big = vec![b'{'; MAX_ENVELOPE_SIZE + 1];
        assert_eq!(
            decode_inbound(&big),
            Err(ProtocolError::TooLarge(MAX_ENVELOPE_SIZE + 1))
        );
    }

    #[test]
    fn test_compact_forms() {
        assert_eq!(
            decode_inbound(b"TFER_APR:t1").expect("decode"),
            Inbound::Legacy(LegacyMessage::Approved {
                transfer_id: "t1".into()
            })
        );
        assert_eq!(
            decode_inbound(b"REJECT:t2").expect("decode"),
            Inbound::Legacy(LegacyMessage::Rejected {
                transfer_id: "t2".into()
            })
        );
        assert_eq!(
            decode_inbound(b"TFER_REQ:t3|ticket|tok-1").expect("decode"),
            Inbound::Legacy(LegacyMessage::TransferRequest {
                transfer_id: "t3".into(),
                token_type: "ticket".into(),
                token_id: "tok-1".into(),
            })
        );
        assert!(matches!(
            decode_inbound(b"TFER_REQ:t3|ticket"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_details_request_not_actionable() {
        let legacy = LegacyMessage::DetailsRequest {
            transfer_id: "t1".into(),
        };
        assert_eq!(legacy.into_envelope(), None);
    }

    #[test]
    fn test_diagnostics_ignored() {
        assert_eq!(
            decode_inbound(b"TEST_PING").expect("decode"),
            Inbound::Diagnostic
        );
    }

    #[test]
    fn test_garbage_unrecognized() {
        assert!(matches!(
            decode_inbound(b"hello there"),
            Err(ProtocolError::Unrecognized(_))
        ));
        assert_eq!(
            decode_inbound(&[0xff, 0xfe]),
            Err(ProtocolError::InvalidUtf8)
        );
    }

    #[test]
    fn test_compact_encoding_roundtrips_to_envelope() {
        for envelope in all_messages() {
            if let Some(compact) = encode_compact(&envelope) {
                match decode_inbound(compact.as_bytes()).expect("decode") {
                    Inbound::Legacy(legacy) => {
                        assert_eq!(legacy.into_envelope(), Some(envelope))
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
        }
    }
}
