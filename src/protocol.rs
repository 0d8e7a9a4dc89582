//! Backplane wire format
//!
//! A frame is the concatenation of varint-length-prefixed messages. Each
//! message body is one action byte (low bits: message kind, high three
//! bits: the change action for `Changed`), the 16-byte sender id, then the
//! kind-specific fields as varint-length-prefixed UTF-8 strings. An empty
//! region string on the wire means "no region". Subscribers accept frames
//! with trailing messages appended and process them in order.

use bytes::{Buf, BufMut};
use uuid::Uuid;

use crate::CacheError;

const KIND_CHANGED: u8 = 0;
const KIND_CLEAR: u8 = 1;
const KIND_CLEAR_REGION: u8 = 2;
const KIND_REMOVE: u8 = 3;

const KIND_MASK: u8 = 0x1f;
const ACTION_SHIFT: u8 = 5;

/// The mutation a `Changed` message announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeAction {
    Add = 0,
    Put = 1,
    Update = 2,
    Remove = 3,
}

impl ChangeAction {
    fn from_bits(bits: u8) -> Result<Self, CacheError> {
        match bits {
            0 => Ok(ChangeAction::Add),
            1 => Ok(ChangeAction::Put),
            2 => Ok(ChangeAction::Update),
            3 => Ok(ChangeAction::Remove),
            other => Err(CacheError::Serialization(format!(
                "unknown change action {other}"
            ))),
        }
    }
}

/// One invalidation message on the backplane.
///
/// Equality (and the outbound set's deduplication) covers sender, action,
/// region and key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BackplaneMessage {
    Changed {
        sender: Uuid,
        action: ChangeAction,
        key: String,
        region: Option<String>,
    },
    Removed {
        sender: Uuid,
        key: String,
        region: Option<String>,
    },
    Clear {
        sender: Uuid,
    },
    ClearRegion {
        sender: Uuid,
        region: String,
    },
}

impl BackplaneMessage {
    pub fn changed(
        sender: Uuid,
        action: ChangeAction,
        key: &str,
        region: Option<&str>,
    ) -> Self {
        BackplaneMessage::Changed {
            sender,
            action,
            key: key.to_owned(),
            region: region.map(str::to_owned),
        }
    }

    pub fn removed(sender: Uuid, key: &str, region: Option<&str>) -> Self {
        BackplaneMessage::Removed {
            sender,
            key: key.to_owned(),
            region: region.map(str::to_owned),
        }
    }

    pub fn clear(sender: Uuid) -> Self {
        BackplaneMessage::Clear { sender }
    }

    pub fn clear_region(sender: Uuid, region: &str) -> Self {
        BackplaneMessage::ClearRegion {
            sender,
            region: region.to_owned(),
        }
    }

    pub fn sender(&self) -> Uuid {
        match self {
            BackplaneMessage::Changed { sender, .. }
            | BackplaneMessage::Removed { sender, .. }
            | BackplaneMessage::Clear { sender }
            | BackplaneMessage::ClearRegion { sender, .. } => *sender,
        }
    }

    pub fn is_clear(&self) -> bool {
        matches!(self, BackplaneMessage::Clear { .. })
    }

    fn encode_body(&self, buf: &mut Vec<u8>) {
        match self {
            BackplaneMessage::Changed {
                sender,
                action,
                key,
                region,
            } => {
                buf.put_u8(KIND_CHANGED | ((*action as u8) << ACTION_SHIFT));
                buf.put_slice(sender.as_bytes());
                put_string(buf, key);
                put_string(buf, region.as_deref().unwrap_or(""));
            }
            BackplaneMessage::Removed {
                sender,
                key,
                region,
            } => {
                buf.put_u8(KIND_REMOVE);
                buf.put_slice(sender.as_bytes());
                put_string(buf, key);
                put_string(buf, region.as_deref().unwrap_or(""));
            }
            BackplaneMessage::Clear { sender } => {
                buf.put_u8(KIND_CLEAR);
                buf.put_slice(sender.as_bytes());
            }
            BackplaneMessage::ClearRegion { sender, region } => {
                buf.put_u8(KIND_CLEAR_REGION);
                buf.put_slice(sender.as_bytes());
                put_string(buf, region);
            }
        }
    }

    fn decode_body(mut body: &[u8]) -> Result<Self, CacheError> {
        if body.remaining() < 17 {
            return Err(CacheError::Serialization(
                "backplane message truncated".to_owned(),
            ));
        }
        let tag = body.get_u8();
        let kind = tag & KIND_MASK;

        let mut sender_bytes = [0u8; 16];
        body.copy_to_slice(&mut sender_bytes);
        let sender = Uuid::from_bytes(sender_bytes);

        match kind {
            KIND_CHANGED => {
                let action = ChangeAction::from_bits(tag >> ACTION_SHIFT)?;
                let key = get_string(&mut body)?;
                let region = get_region(&mut body)?;
                Ok(BackplaneMessage::Changed {
                    sender,
                    action,
                    key,
                    region,
                })
            }
            KIND_REMOVE => {
                let key = get_string(&mut body)?;
                let region = get_region(&mut body)?;
                Ok(BackplaneMessage::Removed {
                    sender,
                    key,
                    region,
                })
            }
            KIND_CLEAR => Ok(BackplaneMessage::Clear { sender }),
            KIND_CLEAR_REGION => {
                let region = get_string(&mut body)?;
                Ok(BackplaneMessage::ClearRegion { sender, region })
            }
            other => Err(CacheError::Serialization(format!(
                "unknown backplane message kind {other}"
            ))),
        }
    }
}

/// Serialize a batch of messages into one frame.
pub fn encode_frame(messages: &[BackplaneMessage]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(messages.len() * 48);
    let mut body = Vec::with_capacity(64);
    for message in messages {
        body.clear();
        message.encode_body(&mut body);
        put_uvarint(&mut frame, body.len() as u64);
        frame.extend_from_slice(&body);
    }
    frame
}

/// Deserialize a frame into its messages, in wire order.
///
/// The frame may carry any number of trailing messages; they all decode.
/// A malformed frame fails as a whole.
pub fn decode_frame(frame: &[u8]) -> Result<Vec<BackplaneMessage>, CacheError> {
    let mut buf = frame;
    let mut messages = Vec::new();
    while buf.has_remaining() {
        let len = get_uvarint(&mut buf)? as usize;
        if buf.remaining() < len {
            return Err(CacheError::Serialization(
                "backplane frame truncated".to_owned(),
            ));
        }
        let (body, rest) = buf.split_at(len);
        messages.push(BackplaneMessage::decode_body(body)?);
        buf = rest;
    }
    Ok(messages)
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    put_uvarint(buf, s.len() as u64);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut &[u8]) -> Result<String, CacheError> {
    let len = get_uvarint(buf)? as usize;
    if buf.remaining() < len {
        return Err(CacheError::Serialization(
            "backplane string truncated".to_owned(),
        ));
    }
    let (raw, rest) = buf.split_at(len);
    let s = std::str::from_utf8(raw)
        .map_err(|e| CacheError::Serialization(format!("invalid utf-8 on the wire: {e}")))?
        .to_owned();
    *buf = rest;
    Ok(s)
}

fn get_region(buf: &mut &[u8]) -> Result<Option<String>, CacheError> {
    let s = get_string(buf)?;
    Ok(if s.is_empty() { None } else { Some(s) })
}

fn put_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

fn get_uvarint(buf: &mut &[u8]) -> Result<u64, CacheError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(CacheError::Serialization(
                "backplane varint truncated".to_owned(),
            ));
        }
        if shift >= 64 {
            return Err(CacheError::Serialization(
                "backplane varint overflow".to_owned(),
            ));
        }
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> Uuid {
        Uuid::from_bytes([7u8; 16])
    }

    #[test]
    fn every_variant_round_trips() {
        let messages = vec![
            BackplaneMessage::changed(sender(), ChangeAction::Add, "k1", None),
            BackplaneMessage::changed(sender(), ChangeAction::Put, "k2", Some("r")),
            BackplaneMessage::changed(sender(), ChangeAction::Update, "k3", Some("r2")),
            BackplaneMessage::removed(sender(), "k4", Some("r")),
            BackplaneMessage::clear(sender()),
            BackplaneMessage::clear_region(sender(), "reg"),
        ];
        let frame = encode_frame(&messages);
        assert_eq!(decode_frame(&frame).unwrap(), messages);
    }

    #[test]
    fn trailing_messages_are_part_of_the_stream() {
        let first = encode_frame(&[BackplaneMessage::clear(sender())]);
        let second = encode_frame(&[BackplaneMessage::removed(sender(), "k", None)]);
        let mut joined = first;
        joined.extend_from_slice(&second);

        let decoded = decode_frame(&joined).unwrap();
        assert_eq!(decoded.len(), 2);
        assert!(decoded[0].is_clear());
    }

    #[test]
    fn empty_region_decodes_as_absent() {
        let frame = encode_frame(&[BackplaneMessage::changed(
            sender(),
            ChangeAction::Put,
            "k",
            None,
        )]);
        match &decode_frame(&frame).unwrap()[0] {
            BackplaneMessage::Changed { region, .. } => assert!(region.is_none()),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn unicode_keys_survive() {
        let msg = BackplaneMessage::removed(sender(), "ключ-🔑", Some("région"));
        let frame = encode_frame(&[msg.clone()]);
        assert_eq!(decode_frame(&frame).unwrap(), vec![msg]);
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let frame = encode_frame(&[BackplaneMessage::clear(sender())]);
        assert!(decode_frame(&frame[..frame.len() - 1]).is_err());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut frame = Vec::new();
        let mut body = vec![9u8];
        body.extend_from_slice(&[0u8; 16]);
        put_uvarint(&mut frame, body.len() as u64);
        frame.extend_from_slice(&body);
        assert!(decode_frame(&frame).is_err());
    }

    #[test]
    fn dedup_equality_covers_sender_action_region_key() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(BackplaneMessage::changed(sender(), ChangeAction::Put, "k", None));
        set.insert(BackplaneMessage::changed(sender(), ChangeAction::Put, "k", None));
        assert_eq!(set.len(), 1);

        set.insert(BackplaneMessage::changed(sender(), ChangeAction::Add, "k", None));
        set.insert(BackplaneMessage::changed(sender(), ChangeAction::Put, "k", Some("r")));
        assert_eq!(set.len(), 3);
    }
}
