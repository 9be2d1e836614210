use crate::error::MuError;
use crate::mu_protobuf::{self, MessageType, MuMessage};
use crate::protocol::{self, Envelope};

// Conversion helpers between our internal types and the protobuf wire types

impl From<protocol::Address> for mu_protobuf::Address {
    fn from(address: protocol::Address) -> Self {
        Self {
            host: address.host,
            port: address.port as u32,
        }
    }
}

impl TryFrom<mu_protobuf::Address> for protocol::Address {
    type Error = MuError;

    fn try_from(address: mu_protobuf::Address) -> Result<Self, MuError> {
        let port = u16::try_from(address.port)
            .map_err(|_| MuError::Protocol(format!("Sender port out of range: {}", address.port)))?;
        Ok(protocol::Address::new(address.host, port))
    }
}

impl From<Envelope> for MuMessage {
    fn from(envelope: Envelope) -> Self {
        let mut message = MuMessage::default();
        match envelope {
            Envelope::Tell { path, payload } => {
                message.set_message_type(MessageType::Tell);
                message.path = Some(path);
                message.payload = payload;
            }
            Envelope::Ask {
                request_id,
                path,
                payload,
            } => {
                message.set_message_type(MessageType::Ask);
                message.request_id = Some(request_id);
                message.path = Some(path);
                message.payload = payload;
            }
            Envelope::Response { request_id, payload } => {
                message.set_message_type(MessageType::Response);
                message.request_id = Some(request_id);
                message.payload = payload;
            }
            Envelope::Heartbeat { sender_address } => {
                message.set_message_type(MessageType::Heartbeat);
                message.sender_address = sender_address.map(Into::into);
            }
            Envelope::Error { request_id, message: error_message } => {
                message.set_message_type(MessageType::Error);
                message.request_id = request_id;
                message.error_message = Some(error_message);
            }
        }
        message
    }
}

fn required(field: Option<String>, name: &str, kind: MessageType) -> Result<String, MuError> {
    field.ok_or_else(|| MuError::Protocol(format!("{} message without {}", kind.as_str_name(), name)))
}

impl TryFrom<MuMessage> for Envelope {
    type Error = MuError;

    fn try_from(message: MuMessage) -> Result<Self, MuError> {
        let kind = MessageType::try_from(message.message_type)
            .map_err(|_| MuError::Protocol(format!("Unknown message type: {}", message.message_type)))?;

        match kind {
            MessageType::Unspecified => Err(MuError::Protocol("Message type not specified".to_string())),
            MessageType::Tell => Ok(Envelope::Tell {
                path: required(message.path, "path", kind)?,
                payload: message.payload,
            }),
            MessageType::Ask => Ok(Envelope::Ask {
                request_id: required(message.request_id, "request id", kind)?,
                path: required(message.path, "path", kind)?,
                payload: message.payload,
            }),
            MessageType::Response => Ok(Envelope::Response {
                request_id: required(message.request_id, "request id", kind)?,
                payload: message.payload,
            }),
            MessageType::Heartbeat => Ok(Envelope::Heartbeat {
                sender_address: message.sender_address.map(protocol::Address::try_from).transpose()?,
            }),
            MessageType::Error => Ok(Envelope::Error {
                request_id: message.request_id,
                message: required(message.error_message, "error message", kind)?,
            }),
        }
    }
}
