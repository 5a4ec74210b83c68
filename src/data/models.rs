//! Data models
//!
//! Rust structs representing database entities. IDs are SQLite rowids;
//! composite fields (audience, mentions, tags, place, time) are stored
//! as JSON columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Opaque local account identifier
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Users
// =============================================================================

/// A local account
#[derive(Debug, Clone)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub display_name: String,
    /// HTML bio shown on the actor document
    pub about: String,
    /// Canonical actor URL, `https://domain/u/name`
    pub url: String,
    /// RSA public key (PEM)
    pub public_key_pem: String,
    /// RSA private key (PEM); read-only after load
    pub private_key_pem: String,
    pub options: UserOptions,
}

/// Per-user behavior toggles, stored as a JSON column
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserOptions {
    /// Expand recognized quote links into blockquotes on ingest
    #[serde(default)]
    pub inline_quotes: bool,
    /// Send a Read ack when a reply to one of our records arrives
    #[serde(default)]
    pub auto_ack: bool,
    /// Base64 32-byte public half of the chat box keypair
    #[serde(default)]
    pub chat_pubkey: String,
    /// Base64 32-byte secret half of the chat box keypair
    #[serde(default)]
    pub chat_seckey: String,
    /// Hashtags advertised on the actor document
    #[serde(default)]
    pub hashtags: Vec<String>,
    /// Avatar image URL
    #[serde(default)]
    pub avatar: String,
    /// Banner image URL
    #[serde(default)]
    pub banner: String,
}

impl User {
    /// Key name advertised on the actor document
    pub fn keyname(&self) -> String {
        format!("{}#key", self.url)
    }
}

// =============================================================================
// Records
// =============================================================================

/// The canonical local form of a post-like object
#[derive(Debug, Clone)]
pub struct Record {
    pub id: i64,
    pub userid: UserId,
    /// Canonical URI the object has on its home server
    pub xid: String,
    /// Display URL when it differs from the xid
    pub url: String,
    /// Compose-time top-level link; a record carrying one federates as
    /// a Page with a Link attachment
    pub link: String,
    /// URI of the parent this replies to
    pub rid: String,
    /// Thread identifier chosen by the thread's originator
    pub convoy: String,
    pub kind: RecordKind,
    /// Actor XID currently bearing the record
    pub honker: String,
    /// Original author XID for a bonk; empty otherwise
    pub oonker: String,
    /// Ordered set of XIDs; first element is the primary addressee
    pub audience: Vec<String>,
    pub public: bool,
    /// HTML body
    pub noise: String,
    /// Content warning / summary
    pub precis: String,
    pub whofore: Whofore,
    pub flags: i64,
    pub date: DateTime<Utc>,
    pub mentions: Vec<Mention>,
    /// Hashtag strings, each beginning with `#`
    pub onties: Vec<String>,
    pub attachments: Vec<Attachment>,
    pub place: Option<Place>,
    pub time: Option<TimeWindow>,
}

impl Default for Record {
    fn default() -> Self {
        Self {
            id: 0,
            userid: UserId(0),
            xid: String::new(),
            url: String::new(),
            link: String::new(),
            rid: String::new(),
            convoy: String::new(),
            kind: RecordKind::Honk,
            honker: String::new(),
            oonker: String::new(),
            audience: Vec::new(),
            public: false,
            noise: String::new(),
            precis: String::new(),
            whofore: Whofore::None,
            flags: 0,
            date: Utc::now(),
            mentions: Vec::new(),
            onties: Vec::new(),
            attachments: Vec::new(),
            place: None,
            time: None,
        }
    }
}

/// Record kinds; the closed set of things a record can be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// A note or article we created or received
    #[default]
    Honk,
    /// An announce (boost) of someone else's record
    Bonk,
    /// An event
    Event,
    /// A question (poll)
    Qonk,
    /// A direct chat message
    Chonk,
    /// A read acknowledgement
    Ack,
    /// An emoji reaction
    React,
    /// A tombstone
    Zonk,
    /// Retraction of a bonk
    Unbonk,
    /// Retraction of an ack
    Deack,
    /// An edit replacing a record with the same xid
    Update,
    /// An actor migration marker
    Move,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Honk => "honk",
            Self::Bonk => "bonk",
            Self::Event => "event",
            Self::Qonk => "qonk",
            Self::Chonk => "chonk",
            Self::Ack => "ack",
            Self::React => "react",
            Self::Zonk => "zonk",
            Self::Unbonk => "unbonk",
            Self::Deack => "deack",
            Self::Update => "update",
            Self::Move => "move",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "honk" => Some(Self::Honk),
            "bonk" => Some(Self::Bonk),
            "event" => Some(Self::Event),
            "qonk" => Some(Self::Qonk),
            "chonk" => Some(Self::Chonk),
            "ack" => Some(Self::Ack),
            "react" => Some(Self::React),
            "zonk" => Some(Self::Zonk),
            "unbonk" => Some(Self::Unbonk),
            "deack" => Some(Self::Deack),
            "update" => Some(Self::Update),
            "move" => Some(Self::Move),
            _ => None,
        }
    }
}

/// Who a record is for, derived on ingest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i64)]
pub enum Whofore {
    /// Foreign record with no particular relation to us
    #[default]
    None = 0,
    /// Foreign record that mentions us
    AtMe = 1,
    /// Our record, world-addressable
    Public = 2,
    /// Our record, limited audience
    Private = 3,
}

impl Whofore {
    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => Self::AtMe,
            2 => Self::Public,
            3 => Self::Private,
            _ => Self::None,
        }
    }
}

/// Record flag bits
pub mod flags {
    pub const ACKED: i64 = 1;
    pub const BONKED: i64 = 2;
    pub const SAVED: i64 = 4;
    pub const REACTED: i64 = 8;
    pub const UNTAGGED: i64 = 16;
}

impl Record {
    pub fn is_acked(&self) -> bool {
        self.flags & flags::ACKED != 0
    }
    pub fn is_bonked(&self) -> bool {
        self.flags & flags::BONKED != 0
    }
}

/// A mention extracted from a tag array
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mention {
    /// Short handle as written, e.g. `@name@host`
    pub handle: String,
    /// Actor XID the handle resolves to
    pub xid: String,
}

/// A named location attached to a record
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Place {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
}

/// Event scheduling info
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    /// Seconds; zero when unknown
    #[serde(default)]
    pub duration_secs: i64,
}

// =============================================================================
// Attachments
// =============================================================================

/// Media or document attached to a record
///
/// File bytes live in the files table, de-duplicated by content hash
/// scoped to media type. `local` is true iff we localized the bytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub file_id: i64,
    /// Stable id used in `/d/<xid>` URLs
    pub xid: String,
    pub name: String,
    pub desc: String,
    pub url: String,
    pub media: String,
    pub local: bool,
    #[serde(default)]
    pub meta: FileMeta,
}

/// Dimensions and size of a localized file
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMeta {
    #[serde(default)]
    pub width: i64,
    #[serde(default)]
    pub height: i64,
    #[serde(default)]
    pub length: i64,
}

// =============================================================================
// Chat messages
// =============================================================================

/// A direct message; kept out of the main record feed
#[derive(Debug, Clone)]
pub struct Chonk {
    pub id: i64,
    pub userid: UserId,
    pub xid: String,
    /// Sender actor XID
    pub who: String,
    /// Recipient actor XID
    pub target: String,
    pub date: DateTime<Utc>,
    pub noise: String,
    pub attachments: Vec<Attachment>,
}

// =============================================================================
// Deliveries
// =============================================================================

/// A parked outbound delivery awaiting retry
///
/// At most one exists per `(userid, recipient)`; messages accumulate in
/// enqueue order and are separated by NUL bytes in persistent form.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: i64,
    pub due: DateTime<Utc>,
    pub userid: UserId,
    pub recipient: String,
    pub tries: i64,
    pub messages: Vec<Vec<u8>>,
}

impl Delivery {
    /// Join messages with the NUL separator used in the pending table
    pub fn encode_messages(messages: &[Vec<u8>]) -> Vec<u8> {
        messages.join(&0u8)
    }

    /// Split a persisted blob back into individual messages
    pub fn decode_messages(data: &[u8]) -> Vec<Vec<u8>> {
        data.split(|b| *b == 0).map(|m| m.to_vec()).collect()
    }
}

// =============================================================================
// Contacts (follow relationships)
// =============================================================================

/// Follow-graph entry for a remote actor
#[derive(Debug, Clone)]
pub struct Contact {
    pub id: i64,
    pub userid: UserId,
    /// Short local name for the contact
    pub name: String,
    /// Actor XID
    pub xid: String,
    pub flavor: ContactFlavor,
    /// Follow activity id used to correlate Accept/Reject/Undo
    pub folxid: String,
}

/// Subscription state for a contact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactFlavor {
    /// We asked to follow; awaiting Accept
    Presub,
    /// We follow them
    Sub,
    /// We no longer follow them
    Unsub,
    /// Watched without following
    Peep,
    /// They follow us
    Dub,
    /// They used to follow us
    Undub,
}

impl ContactFlavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Presub => "presub",
            Self::Sub => "sub",
            Self::Unsub => "unsub",
            Self::Peep => "peep",
            Self::Dub => "dub",
            Self::Undub => "undub",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "presub" => Some(Self::Presub),
            "sub" => Some(Self::Sub),
            "unsub" => Some(Self::Unsub),
            "peep" => Some(Self::Peep),
            "dub" => Some(Self::Dub),
            "undub" => Some(Self::Undub),
            _ => None,
        }
    }
}

// =============================================================================
// Filters
// =============================================================================

/// User-defined ingest filter
///
/// Matches on the honker/oonker XID or origin, or a regex against the
/// record text and attachment names. Matching records are rejected
/// before persistence, or merely skip media localization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub id: i64,
    pub userid: UserId,
    pub name: String,
    /// Actor XID or bare hostname to match against honker/oonker
    #[serde(default)]
    pub actor: String,
    /// Also match any actor from the same origin as `actor`
    #[serde(default)]
    pub include_audience: bool,
    /// Regex matched against noise, precis, and attachment names
    #[serde(default)]
    pub text: String,
    /// Drop the record entirely
    #[serde(default)]
    pub reject: bool,
    /// Keep the record but skip attachment localization
    #[serde(default)]
    pub skip_media: bool,
    /// Refuse announces from this actor/origin
    #[serde(default)]
    pub is_announce: bool,
}

// =============================================================================
// Keys
// =============================================================================

/// Signing identity for a local user
#[derive(Clone)]
pub struct KeyInfo {
    /// `<user-url>#key`
    pub keyname: String,
    pub seckey: crate::federation::signature::PrivateKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_kind_round_trips() {
        for kind in [
            RecordKind::Honk,
            RecordKind::Bonk,
            RecordKind::Event,
            RecordKind::Qonk,
            RecordKind::Chonk,
            RecordKind::Ack,
            RecordKind::React,
            RecordKind::Zonk,
            RecordKind::Unbonk,
            RecordKind::Deack,
            RecordKind::Update,
            RecordKind::Move,
        ] {
            assert_eq!(RecordKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(RecordKind::from_str("florb"), None);
    }

    #[test]
    fn delivery_messages_round_trip_nul_join() {
        let messages = vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()];
        let encoded = Delivery::encode_messages(&messages);
        assert_eq!(Delivery::decode_messages(&encoded), messages);
    }

    #[test]
    fn whofore_from_i64_defaults_to_none() {
        assert_eq!(Whofore::from_i64(2), Whofore::Public);
        assert_eq!(Whofore::from_i64(99), Whofore::None);
    }
}
