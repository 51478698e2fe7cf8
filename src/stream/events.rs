//! Typed audience events decoded from MESSAGE bodies.
//!
//! Each body is a JSON envelope `{"cmd": ..., "data": {...}}`. The `cmd`
//! tag selects one [`LiveEvent`] variant; unrecognized tags surface as
//! [`LiveEvent::Unknown`] with the envelope intact.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const CMD_CHAT: &str = "LIVE_OPEN_PLATFORM_DM";
pub const CMD_GIFT: &str = "LIVE_OPEN_PLATFORM_SEND_GIFT";
pub const CMD_SUPER_CHAT: &str = "LIVE_OPEN_PLATFORM_SUPER_CHAT";
pub const CMD_SUPER_CHAT_WITHDRAW: &str = "LIVE_OPEN_PLATFORM_SUPER_CHAT_DEL";
pub const CMD_GUARD: &str = "LIVE_OPEN_PLATFORM_GUARD";
pub const CMD_LIKE: &str = "LIVE_OPEN_PLATFORM_LIKE";
pub const CMD_ROOM_ENTER: &str = "LIVE_OPEN_PLATFORM_LIVE_ROOM_ENTER";
pub const CMD_STREAM_START: &str = "LIVE_OPEN_PLATFORM_LIVE_START";
pub const CMD_STREAM_END: &str = "LIVE_OPEN_PLATFORM_LIVE_END";
pub const CMD_INTERACTION_END: &str = "LIVE_OPEN_PLATFORM_INTERACTION_END";

/// Raw `{cmd, data}` envelope.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub cmd: String,
    #[serde(default)]
    pub data: Value,
}

/// Viewer chat message (danmu).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChatMessage {
    pub uname: String,
    pub uid: i64,
    pub open_id: String,
    pub union_id: Option<String>,
    pub uface: String,
    pub timestamp: i64,
    pub room_id: i64,
    pub msg: String,
    pub msg_id: String,
    pub guard_level: i64,
    pub fans_medal_wearing_status: bool,
    pub fans_medal_name: String,
    pub fans_medal_level: i64,
    pub emoji_img_url: String,
    /// 0 for text, 1 for an emoji sticker.
    pub dm_type: i64,
    pub glory_level: i64,
    pub reply_open_id: String,
    pub reply_uname: String,
    pub is_admin: i64,
}

impl ChatMessage {
    pub fn is_emoji(&self) -> bool {
        self.dm_type == 1
    }

    pub fn is_reply(&self) -> bool {
        !self.reply_uname.is_empty()
    }

    pub fn guard_tier(&self) -> Option<GuardTier> {
        GuardTier::from_level(self.guard_level)
    }
}

/// Subscription tier, lowest level number is the most expensive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GuardTier {
    Governor,
    Admiral,
    Captain,
}

impl GuardTier {
    pub fn from_level(level: i64) -> Option<Self> {
        match level {
            1 => Some(Self::Governor),
            2 => Some(Self::Admiral),
            3 => Some(Self::Captain),
            _ => None,
        }
    }
}

/// Identity of the broadcaster receiving a gift.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GiftRecipient {
    pub uid: i64,
    pub open_id: String,
    pub union_id: Option<String>,
    pub uname: String,
    pub uface: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ComboInfo {
    pub combo_base_num: i64,
    pub combo_count: i64,
    pub combo_id: String,
    /// Seconds the combo stays open.
    pub combo_timeout: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BlindGift {
    pub blind_gift_id: i64,
    pub status: bool,
}

/// Gift sent to the broadcaster. Prices are in 1/1000 CNY.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GiftMessage {
    pub room_id: i64,
    pub uid: i64,
    pub open_id: String,
    pub union_id: Option<String>,
    pub uname: String,
    pub uface: String,
    pub gift_id: i64,
    pub gift_name: String,
    pub gift_num: i64,
    pub price: i64,
    pub r_price: i64,
    pub paid: bool,
    pub fans_medal_level: i64,
    pub fans_medal_name: String,
    pub fans_medal_wearing_status: bool,
    pub guard_level: i64,
    pub timestamp: i64,
    pub anchor_info: GiftRecipient,
    pub msg_id: String,
    pub gift_icon: String,
    pub combo_gift: bool,
    pub combo_info: Option<ComboInfo>,
    pub blind_gift: Option<BlindGift>,
}

/// Paid, pinned message.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SuperChatMessage {
    pub room_id: i64,
    pub uid: i64,
    pub open_id: String,
    pub union_id: Option<String>,
    pub uname: String,
    pub uface: String,
    pub message_id: i64,
    pub message: String,
    /// Amount paid, in CNY.
    pub rmb: i64,
    pub timestamp: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub guard_level: i64,
    pub fans_medal_level: i64,
    pub fans_medal_name: String,
    pub fans_medal_wearing_status: bool,
    pub msg_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SuperChatWithdrawMessage {
    pub room_id: i64,
    pub message_ids: Vec<i64>,
    pub msg_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GuardUser {
    pub uid: i64,
    pub open_id: String,
    pub union_id: Option<String>,
    pub uname: String,
    pub uface: String,
}

/// Subscription purchase.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GuardMessage {
    pub user_info: GuardUser,
    pub guard_level: i64,
    pub guard_num: i64,
    pub guard_unit: String,
    pub price: i64,
    pub fans_medal_level: i64,
    pub fans_medal_name: String,
    pub fans_medal_wearing_status: bool,
    pub room_id: i64,
    pub msg_id: String,
    pub timestamp: i64,
}

impl GuardMessage {
    pub fn tier(&self) -> Option<GuardTier> {
        GuardTier::from_level(self.guard_level)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LikeMessage {
    pub uname: String,
    pub uid: i64,
    pub open_id: String,
    pub union_id: Option<String>,
    pub uface: String,
    pub timestamp: i64,
    pub room_id: i64,
    pub like_text: String,
    /// Likes by this viewer aggregated over the last couple of seconds.
    pub like_count: i64,
    pub fans_medal_wearing_status: bool,
    pub fans_medal_name: String,
    pub fans_medal_level: i64,
    pub guard_level: i64,
    pub msg_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RoomEnterMessage {
    pub room_id: i64,
    pub uface: String,
    pub uname: String,
    pub open_id: String,
    pub union_id: Option<String>,
    pub timestamp: i64,
}

/// Shared shape of stream start and stream end notifications.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StreamStateMessage {
    pub room_id: i64,
    pub open_id: String,
    pub union_id: Option<String>,
    pub timestamp: i64,
    pub area_name: String,
    pub title: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InteractionEndMessage {
    pub game_id: String,
    pub timestamp: i64,
}

/// Closed set of audience events.
#[derive(Clone, Debug, PartialEq)]
pub enum LiveEvent {
    Chat(ChatMessage),
    Gift(GiftMessage),
    SuperChat(SuperChatMessage),
    SuperChatWithdraw(SuperChatWithdrawMessage),
    Guard(GuardMessage),
    Like(LikeMessage),
    RoomEnter(RoomEnterMessage),
    StreamStart(StreamStateMessage),
    StreamEnd(StreamStateMessage),
    InteractionEnd(InteractionEndMessage),
    Unknown(Envelope),
}

impl LiveEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Chat(_) => EventKind::Chat,
            Self::Gift(_) => EventKind::Gift,
            Self::SuperChat(_) => EventKind::SuperChat,
            Self::SuperChatWithdraw(_) => EventKind::SuperChatWithdraw,
            Self::Guard(_) => EventKind::Guard,
            Self::Like(_) => EventKind::Like,
            Self::RoomEnter(_) => EventKind::RoomEnter,
            Self::StreamStart(_) => EventKind::StreamStart,
            Self::StreamEnd(_) => EventKind::StreamEnd,
            Self::InteractionEnd(_) => EventKind::InteractionEnd,
            Self::Unknown(_) => EventKind::Unknown,
        }
    }
}

/// Callback key, one per [`LiveEvent`] variant.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EventKind {
    Chat,
    Gift,
    SuperChat,
    SuperChatWithdraw,
    Guard,
    Like,
    RoomEnter,
    StreamStart,
    StreamEnd,
    InteractionEnd,
    Unknown,
}

impl EventKind {
    pub const ALL: [EventKind; 11] = [
        Self::Chat,
        Self::Gift,
        Self::SuperChat,
        Self::SuperChatWithdraw,
        Self::Guard,
        Self::Like,
        Self::RoomEnter,
        Self::StreamStart,
        Self::StreamEnd,
        Self::InteractionEnd,
        Self::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "danmu",
            Self::Gift => "send_gift",
            Self::SuperChat => "super_chat",
            Self::SuperChatWithdraw => "super_chat_del",
            Self::Guard => "guard",
            Self::Like => "like",
            Self::RoomEnter => "live_room_enter",
            Self::StreamStart => "live_start",
            Self::StreamEnd => "live_end",
            Self::InteractionEnd => "interaction_end",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| DecodeError::UnknownKind(value.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("body is not a {{cmd, data}} envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("{cmd} payload did not match its schema: {source}")]
    Payload {
        cmd: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown event kind: {0}")]
    UnknownKind(String),
}

/// Decodes one MESSAGE body into a typed event.
pub fn decode_event(body: &[u8]) -> Result<LiveEvent, DecodeError> {
    let envelope: Envelope = serde_json::from_slice(body).map_err(DecodeError::Envelope)?;
    decode_envelope(envelope)
}

/// Maps a parsed envelope onto its event variant.
pub fn decode_envelope(envelope: Envelope) -> Result<LiveEvent, DecodeError> {
    let event = match envelope.cmd.as_str() {
        CMD_CHAT => LiveEvent::Chat(payload(&envelope)?),
        CMD_GIFT => LiveEvent::Gift(payload(&envelope)?),
        CMD_SUPER_CHAT => LiveEvent::SuperChat(payload(&envelope)?),
        CMD_SUPER_CHAT_WITHDRAW => LiveEvent::SuperChatWithdraw(payload(&envelope)?),
        CMD_GUARD => LiveEvent::Guard(payload(&envelope)?),
        CMD_LIKE => LiveEvent::Like(payload(&envelope)?),
        CMD_ROOM_ENTER => LiveEvent::RoomEnter(payload(&envelope)?),
        CMD_STREAM_START => LiveEvent::StreamStart(payload(&envelope)?),
        CMD_STREAM_END => LiveEvent::StreamEnd(payload(&envelope)?),
        CMD_INTERACTION_END => LiveEvent::InteractionEnd(payload(&envelope)?),
        _ => LiveEvent::Unknown(envelope),
    };
    Ok(event)
}

fn payload<T: serde::de::DeserializeOwned>(envelope: &Envelope) -> Result<T, DecodeError> {
    T::deserialize(&envelope.data).map_err(|source| DecodeError::Payload {
        cmd: envelope.cmd.clone(),
        source,
    })
}
