use std::collections::HashMap;

use bytes::Bytes;

/// A message handed from a source driver to a dispatch engine.
///
/// Only the payload is universal; every other field is populated when the
/// broker has the concept (keys and sequences for partitioned logs,
/// attributes for queues and subjects). Acknowledgement state never travels
/// on the message: each engine's driver trait carries its own token type,
/// so a token minted by one driver cannot reach another.
#[derive(Debug, Clone, Default)]
pub struct SourceMessage {
    /// Message body; `None` is a tombstone record.
    pub payload: Option<Bytes>,
    /// Partition/ordering key, where the broker has one.
    pub key: Option<Bytes>,
    /// Broker headers or attributes, passed through to the HTTP request.
    pub attributes: HashMap<String, String>,
    /// Originating partition or shard id.
    pub partition_id: Option<String>,
    /// Sequence identifier usable as a resume cursor.
    pub sequence: Option<String>,
}

impl SourceMessage {
    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }

    /// Payload rendered as a string for the error envelope's request echo.
    pub fn payload_string(&self) -> String {
        match &self.payload {
            Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            None => String::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tombstone_detection() {
        assert!(SourceMessage::default().is_tombstone());
        let msg = SourceMessage {
            payload: Some(Bytes::from_static(b"hello")),
            ..Default::default()
        };
        assert!(!msg.is_tombstone());
        assert_eq!(msg.payload_string(), "hello");
    }
}
