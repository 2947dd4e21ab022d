//! Data models for PlayerLink

use crate::error::{Error, Result};
use crate::semver::SemVer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Canonical uuid form: undashed lowercase hex. Any format `Uuid`
/// parses is accepted on input.
pub fn sanitize_uuid(uuid: &str) -> Result<String> {
    Uuid::parse_str(uuid.trim())
        .map(|parsed| parsed.simple().to_string())
        .map_err(|_| Error::InvalidUuid(uuid.to_string()))
}

// ============================================================================
// User
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    #[default]
    None,
    Request,
    Friend,
    Blocked,
}

impl Relation {
    pub fn id(&self) -> &'static str {
        match self {
            Relation::None => "none",
            Relation::Request => "request",
            Relation::Friend => "friend",
            Relation::Blocked => "blocked",
        }
    }

    /// Unknown wire values degrade to `None` instead of failing the
    /// containing decode.
    pub fn from_id(id: &str) -> Self {
        match id {
            "request" => Relation::Request,
            "friend" => Relation::Friend,
            "blocked" => Relation::Blocked,
            _ => Relation::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub title: String,
    pub description: String,
    pub started: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub online: bool,
    pub last_online: Option<DateTime<Utc>>,
    pub activity: Option<Activity>,
}

impl Status {
    pub fn unknown() -> Self {
        Self {
            online: false,
            last_online: None,
            activity: None,
        }
    }

    /// Offline users always get the offline title, whatever the stored
    /// activity claims.
    pub fn title(&self) -> &str {
        if !self.online {
            return "offline";
        }
        self.activity
            .as_ref()
            .map(|a| a.title.as_str())
            .unwrap_or("online")
    }

    pub fn description(&self) -> &str {
        if !self.online {
            return "";
        }
        self.activity
            .as_ref()
            .map(|a| a.description.as_str())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OldUsername {
    pub name: String,
    pub public: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub uuid: String,
    pub name: String,
    pub relation: Relation,
    pub registered: DateTime<Utc>,
    pub status: Status,
    pub previous_usernames: Vec<OldUsername>,
}

impl User {
    pub fn new(
        uuid: &str,
        name: String,
        relation: Relation,
        registered: DateTime<Utc>,
        status: Status,
        previous_usernames: Vec<OldUsername>,
    ) -> Result<Self> {
        Ok(Self {
            uuid: sanitize_uuid(uuid)?,
            name,
            relation,
            registered,
            status,
            previous_usernames,
        })
    }
}

impl PartialEq for User {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}

impl Eq for User {}

impl std::hash::Hash for User {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.uuid.hash(state);
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub channel_id: String,
    pub sender: User,
    /// May differ from `sender.name`, e.g. for proxied messages.
    pub sender_display_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl PartialEq for ChatMessage {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ChatMessage {}

// ============================================================================
// Channels
// ============================================================================

/// Server-enforced retention rule for a channel's message history. The
/// client only validates and displays it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    /// Keep everything.
    Channel,
    /// Keep the last `n` messages.
    Count(u32),
    /// Keep messages newer than this many seconds.
    Duration(u64),
    /// Both bounds, the more restrictive one wins.
    CountDuration(u32, u64),
}

impl Persistence {
    pub fn type_id(&self) -> &'static str {
        match self {
            Persistence::Channel => "channel",
            Persistence::Count(_) => "count",
            Persistence::Duration(_) => "duration",
            Persistence::CountDuration(_, _) => "count_duration",
        }
    }

    pub fn to_json(&self) -> Value {
        match *self {
            Persistence::Channel => json!({"type": "channel"}),
            Persistence::Count(count) => json!({"type": "count", "count": count}),
            Persistence::Duration(duration) => {
                json!({"type": "duration", "duration": duration})
            }
            Persistence::CountDuration(count, duration) => {
                json!({"type": "count_duration", "count": count, "duration": duration})
            }
        }
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let field = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::Decode(format!("missing persistence field `{name}`")))
        };
        match value.get("type").and_then(Value::as_str) {
            Some("channel") => Ok(Persistence::Channel),
            Some("count") => Ok(Persistence::Count(field("count")? as u32)),
            Some("duration") => Ok(Persistence::Duration(field("duration")?)),
            Some("count_duration") => Ok(Persistence::CountDuration(
                field("count")? as u32,
                field("duration")?,
            )),
            Some(other) => Err(Error::Decode(format!("unknown persistence type `{other}`"))),
            None => Err(Error::Decode("missing persistence type".into())),
        }
    }

    /// Retention bounds must be positive before submission.
    pub fn validate(&self) -> Result<()> {
        let ok = match *self {
            Persistence::Channel => true,
            Persistence::Count(count) => count > 0,
            Persistence::Duration(duration) => duration > 0,
            Persistence::CountDuration(count, duration) => count > 0 && duration > 0,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidPersistence)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Group,
    Dm,
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub id: String,
    name: String,
    pub persistence: Persistence,
    pub owner: User,
    /// For a DM this holds exactly the receiver.
    pub participants: Vec<User>,
    pub messages: Vec<ChatMessage>,
    kind: ChannelKind,
}

impl Channel {
    pub fn group(
        id: String,
        name: String,
        persistence: Persistence,
        owner: User,
        participants: Vec<User>,
        messages: Vec<ChatMessage>,
    ) -> Self {
        Self {
            id,
            name,
            persistence,
            owner,
            participants,
            messages,
            kind: ChannelKind::Group,
        }
    }

    /// Build a DM, deriving the receiver as the one member that is not
    /// ourselves.
    pub fn dm(
        id: String,
        name: String,
        persistence: Persistence,
        owner: User,
        members: Vec<User>,
        messages: Vec<ChatMessage>,
        own_uuid: &str,
    ) -> Result<Self> {
        let receiver = std::iter::once(owner.clone())
            .chain(members)
            .find(|user| user.uuid != own_uuid)
            .ok_or_else(|| Error::Decode(format!("dm `{id}` has no receiver")))?;
        Ok(Self {
            id,
            name,
            persistence,
            owner,
            participants: vec![receiver],
            messages,
            kind: ChannelKind::Dm,
        })
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn is_dm(&self) -> bool {
        self.kind == ChannelKind::Dm
    }

    /// Groups show their stored name, DMs the receiver's current name.
    pub fn display_name(&self) -> &str {
        match self.kind {
            ChannelKind::Dm => &self.participants[0].name,
            ChannelKind::Group => &self.name,
        }
    }

    pub fn stored_name(&self) -> &str {
        &self.name
    }

    pub fn receiver(&self) -> Option<&User> {
        match self.kind {
            ChannelKind::Dm => self.participants.first(),
            ChannelKind::Group => None,
        }
    }

    /// Owner first, then the remaining participants.
    pub fn all_users(&self) -> Vec<&User> {
        let mut users = Vec::with_capacity(self.participants.len() + 1);
        users.push(&self.owner);
        users.extend(self.participants.iter().filter(|user| **user != self.owner));
        users
    }
}

// ============================================================================
// Global data
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalData {
    pub total_players: u64,
    pub online_players: u64,
    pub latest_version: SemVer,
    pub notes: String,
}

impl GlobalData {
    /// Placeholder while the service is disabled or unreachable.
    pub const EMPTY: GlobalData = GlobalData {
        total_players: 0,
        online_players: 0,
        latest_version: SemVer::EMPTY,
        notes: String::new(),
    };
}

// ============================================================================
// Account settings
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSettings {
    pub show_registered: bool,
    pub retain_usernames: bool,
    pub show_last_online: bool,
    pub show_activity: bool,
    pub allow_friends_image_access: bool,
}

#[cfg(test)]
pub(crate) fn test_user(uuid: &str, name: &str) -> User {
    use chrono::TimeZone;
    User::new(
        uuid,
        name.to_string(),
        Relation::None,
        Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap(),
        Status::unknown(),
        Vec::new(),
    )
    .unwrap()
}
