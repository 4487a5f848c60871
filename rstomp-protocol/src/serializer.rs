//! Pluggable message body serialization.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::headers::header;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Converts typed values to and from frame bodies.
pub trait MessageSerializer {
    /// MIME type written to the `content-type` header.
    fn content_type(&self) -> &'static str;

    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, ProtocolError>;

    fn deserialize<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, ProtocolError>;

    /// Serializes `value` into the frame body and sets `content-type`.
    fn write_body<T: Serialize + ?Sized>(
        &self,
        frame: &mut Frame,
        value: &T,
    ) -> Result<(), ProtocolError> {
        let body = self.serialize(value)?;
        frame.headers.set(header::CONTENT_TYPE, self.content_type());
        frame.set_body(body);
        Ok(())
    }

    /// Deserializes the frame body. A missing body reads as empty input.
    fn read_body<T: DeserializeOwned>(&self, frame: &Frame) -> Result<T, ProtocolError> {
        self.deserialize(frame.body.as_deref().unwrap_or_default())
    }
}

/// JSON bodies via serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl MessageSerializer for JsonSerializer {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn deserialize<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u32,
        item: String,
    }

    #[test]
    fn test_json_body() {
        let order = Order {
            id: 7,
            item: "widget".to_string(),
        };
        let mut frame = Frame::from_command(Command::Send);
        JsonSerializer.write_body(&mut frame, &order).unwrap();

        assert_eq!(frame.header("content-type"), Some("application/json"));
        assert_eq!(frame.content_length(), frame.body.as_ref().unwrap().len());

        let back: Order = JsonSerializer.read_body(&frame).unwrap();
        assert_eq!(back, order);
    }

    #[test]
    fn test_invalid_json() {
        let frame = Frame::from_command(Command::Message).with_body("{not json");
        let result: Result<Order, _> = JsonSerializer.read_body(&frame);
        assert!(matches!(result, Err(ProtocolError::Json(_))));
    }
}
