//! Binary sync protocol (y-protocols compatible).
//!
//! Wire format, all integers lib0 var-uint:
//! ```text
//! message      := kind:varuint payload
//! kind 0 sync  := sub:varuint data:varbytes     sub 0 step-1 (state vector)
//!                                              sub 1 step-2 (update)
//!                                              sub 2 update
//! kind 1 aware := varbytes( count (client clock json:varstring)* )
//! kind 2 auth  := sub:varuint reason:varstring  sub 0 permission denied
//! kind 3 query := (empty)
//! ```
//!
//! Handshake: each side sends step-1 with its state vector, the other
//! answers step-2 with everything the sender lacks. Afterwards both sides
//! exchange incremental updates.

use arbor_core::{is_empty_update, TreeDoc, TreeError};
use thiserror::Error;
use yrs::encoding::read::{self, Cursor, Read};
use yrs::encoding::write::Write;
use yrs::sync::protocol::{
    MSG_AUTH, MSG_AWARENESS, MSG_QUERY_AWARENESS, MSG_SYNC, MSG_SYNC_STEP_1, MSG_SYNC_STEP_2,
    MSG_SYNC_UPDATE, PERMISSION_DENIED,
};

use crate::awareness::AwarenessUpdate;

/// Leading message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Sync = MSG_SYNC,
    Awareness = MSG_AWARENESS,
    Auth = MSG_AUTH,
    QueryAwareness = MSG_QUERY_AWARENESS,
}

impl MessageKind {
    pub fn from_u64(kind: u64) -> Option<Self> {
        match u8::try_from(kind).ok()? {
            MSG_SYNC => Some(Self::Sync),
            MSG_AWARENESS => Some(Self::Awareness),
            MSG_AUTH => Some(Self::Auth),
            MSG_QUERY_AWARENESS => Some(Self::QueryAwareness),
            _ => None,
        }
    }
}

/// Document synchronization sub-message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Encoded state vector of the sender.
    Step1(Vec<u8>),
    /// Update answering a step-1.
    Step2(Vec<u8>),
    /// Incremental update.
    Update(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Sync(SyncMessage),
    Awareness(AwarenessUpdate),
    /// Reserved. Decoded and ignored; it grants nothing.
    Auth(Option<String>),
    QueryAwareness,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Sync(_) => MessageKind::Sync,
            Message::Awareness(_) => MessageKind::Awareness,
            Message::Auth(_) => MessageKind::Auth,
            Message::QueryAwareness => MessageKind::QueryAwareness,
        }
    }

    pub fn step1(doc: &TreeDoc) -> Self {
        Message::Sync(SyncMessage::Step1(doc.state_vector()))
    }

    pub fn update(update: Vec<u8>) -> Self {
        Message::Sync(SyncMessage::Update(update))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf: Vec<u8> = Vec::new();
        buf.write_var(self.kind() as u8);
        match self {
            Message::Sync(sync) => {
                let (sub, data) = match sync {
                    SyncMessage::Step1(sv) => (MSG_SYNC_STEP_1, sv),
                    SyncMessage::Step2(update) => (MSG_SYNC_STEP_2, update),
                    SyncMessage::Update(update) => (MSG_SYNC_UPDATE, update),
                };
                buf.write_var(sub);
                buf.write_buf(data);
            }
            Message::Awareness(update) => {
                buf.write_buf(update.encode());
            }
            Message::Auth(reason) => {
                buf.write_var(PERMISSION_DENIED);
                buf.write_string(reason.as_deref().unwrap_or_default());
            }
            Message::QueryAwareness => {}
        }
        buf
    }

    /// Decode one frame. Trailing bytes after the message are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(bytes);
        let kind: u64 = cursor.read_var()?;
        match MessageKind::from_u64(kind) {
            Some(MessageKind::Sync) => {
                let sub: u64 = cursor.read_var()?;
                let data = cursor.read_buf()?.to_vec();
                let sync = match u8::try_from(sub) {
                    Ok(MSG_SYNC_STEP_1) => SyncMessage::Step1(data),
                    Ok(MSG_SYNC_STEP_2) => SyncMessage::Step2(data),
                    Ok(MSG_SYNC_UPDATE) => SyncMessage::Update(data),
                    _ => return Err(ProtocolError::UnknownSyncKind(sub)),
                };
                Ok(Message::Sync(sync))
            }
            Some(MessageKind::Awareness) => {
                let payload = cursor.read_buf()?;
                Ok(Message::Awareness(AwarenessUpdate::decode(payload)?))
            }
            Some(MessageKind::Auth) => {
                let sub: u64 = cursor.read_var()?;
                let reason = read_str(&mut cursor)?;
                Ok(Message::Auth(
                    (sub == PERMISSION_DENIED as u64).then(|| reason.to_string()),
                ))
            }
            Some(MessageKind::QueryAwareness) => Ok(Message::QueryAwareness),
            None => Err(ProtocolError::UnknownMessageKind(kind)),
        }
    }
}

/// Length-prefixed UTF-8 string, validated.
pub(crate) fn read_str<'c>(cursor: &'c mut Cursor<'_>) -> Result<&'c str, ProtocolError> {
    let bytes = cursor.read_buf()?;
    std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)
}

/// Result of feeding one sync message to a replica.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    /// Message to send back to the peer, if any.
    pub reply: Option<SyncMessage>,
    /// Effective update produced by applying the message.
    pub applied: Option<Vec<u8>>,
}

/// Apply one sync message to `doc`.
///
/// Step-1 yields a step-2 reply; step-2 and updates are applied and their
/// effective change is returned so the caller can fan it out.
pub fn handle_sync(doc: &TreeDoc, msg: &SyncMessage) -> Result<SyncOutcome, ProtocolError> {
    match msg {
        SyncMessage::Step1(sv) => Ok(SyncOutcome {
            reply: Some(SyncMessage::Step2(doc.diff(sv)?)),
            applied: None,
        }),
        SyncMessage::Step2(update) | SyncMessage::Update(update) => {
            let effective = doc.apply_update(update)?;
            Ok(SyncOutcome {
                reply: None,
                applied: (!is_empty_update(&effective)).then_some(effective),
            })
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Decode(#[from] read::Error),

    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("Unknown message kind {0}")]
    UnknownMessageKind(u64),

    #[error("Unknown sync message kind {0}")]
    UnknownSyncKind(u64),

    #[error("Invalid awareness state: {0}")]
    InvalidAwareness(String),

    #[error(transparent)]
    Document(#[from] TreeError),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection failed: {0}")]
    Connect(String),
}
