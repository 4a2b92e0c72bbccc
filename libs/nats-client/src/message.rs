//! Messages handed to subscribers and returned from requests.

use std::str::Utf8Error;

use bytes::Bytes;
use nats_core::MessageHandle;
use serde::de::DeserializeOwned;

/// A message received from NATS.
///
/// Everything is copied out of the engine's buffers, so the value outlives
/// the delivery that produced it. Cloning only bumps the payload refcount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatsMessage {
    subject: String,
    payload: Bytes,
    reply_to: Option<String>,
}

impl NatsMessage {
    /// Message on `subject` without a reply subject.
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            reply_to: None,
        }
    }

    /// Set the subject replies should go to.
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Copy a delivered message out of the engine. `None` if the engine
    /// handed over a message without a subject.
    pub(crate) fn copy_from(msg: &MessageHandle<'_>) -> Option<Self> {
        let subject = msg.subject()?;
        Some(Self {
            subject: subject.to_owned(),
            payload: Bytes::copy_from_slice(msg.data().unwrap_or_default()),
            reply_to: msg.reply().map(str::to_owned),
        })
    }

    /// Subject the message was published on.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Raw payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Reply subject, set for requests.
    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    /// Payload as UTF-8 text.
    pub fn as_str(&self) -> Result<&str, Utf8Error> {
        std::str::from_utf8(&self.payload)
    }

    /// Decode the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use nats_core::NativeMessage;
    use serde::Deserialize;

    use super::*;

    #[test]
    fn test_copy_from_handle() {
        let native = NativeMessage::new("test.pubsub", Some("_INBOX.x".into()), "hello");
        let msg = NatsMessage::copy_from(&native.handle()).unwrap();
        drop(native);
        assert_eq!(msg.subject(), "test.pubsub");
        assert_eq!(msg.payload().as_ref(), b"hello");
        assert_eq!(msg.reply_to(), Some("_INBOX.x"));
        assert_eq!(msg.as_str(), Ok("hello"));
    }

    #[test]
    fn test_copy_rejects_missing_subject() {
        let native = NativeMessage::new("", None, "x");
        assert!(NatsMessage::copy_from(&native.handle()).is_none());
    }

    #[test]
    fn test_json_payload() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Ping {
            seq: u32,
        }
        let msg = NatsMessage::new("ping", r#"{"seq":7}"#);
        assert_eq!(msg.json::<Ping>().unwrap(), Ping { seq: 7 });
        assert!(NatsMessage::new("ping", "nope").json::<Ping>().is_err());
        assert!(NatsMessage::new("bin", vec![0xff, 0xfe]).as_str().is_err());
    }
}
