use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Identifier assigned by the external platform (a Discord snowflake).
pub type ClientId = i64;

/// Whether post-creation / post-deletion processing has finished for a row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[repr(i32)]
pub enum BatchStatus {
    Yet = 0,
    Done = 1,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Yet => "yet",
            BatchStatus::Done => "done",
        }
    }
}

/// Originating platform of a mirrored entity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[repr(i32)]
pub enum CategoryType {
    Discord = 0,
}

impl CategoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CategoryType::Discord => "discord",
        }
    }
}

/// Local channel classification, independent of the platform's numbering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[repr(i32)]
pub enum ChannelType {
    Text = 0,
    Voice = 1,
    Category = 2,
    Announcement = 3,
    Forum = 4,
    PublicThread = 5,
    PrivateThread = 6,
    Other = 7,
}

impl ChannelType {
    /// Map a Discord channel type tag. Returns `None` for channels that do
    /// not belong to a guild (DMs and group DMs).
    pub fn from_platform(tag: u8) -> Option<ChannelType> {
        let mapped = match tag {
            1 | 3 => return None,
            0 => ChannelType::Text,
            2 | 13 => ChannelType::Voice,
            4 => ChannelType::Category,
            5 | 10 => ChannelType::Announcement,
            15 | 16 => ChannelType::Forum,
            11 => ChannelType::PublicThread,
            12 => ChannelType::PrivateThread,
            _ => ChannelType::Other,
        };
        Some(mapped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Text => "text",
            ChannelType::Voice => "voice",
            ChannelType::Category => "category",
            ChannelType::Announcement => "announcement",
            ChannelType::Forum => "forum",
            ChannelType::PublicThread => "public_thread",
            ChannelType::PrivateThread => "private_thread",
            ChannelType::Other => "other",
        }
    }
}

/// The mirrored entity kinds, one table each.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Community,
    User,
    Channel,
    Role,
}

impl EntityKind {
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Community => "communities",
            EntityKind::User => "users",
            EntityKind::Channel => "channels",
            EntityKind::Role => "roles",
        }
    }

    /// Rows of every kind except Community belong to a community.
    pub fn is_community_scoped(&self) -> bool {
        !matches!(self, EntityKind::Community)
    }

    pub fn column_key(&self) -> ColumnKey {
        match self {
            EntityKind::Community => ColumnKey::Community,
            EntityKind::User => ColumnKey::User,
            EntityKind::Channel => ColumnKey::Channel,
            EntityKind::Role => ColumnKey::Role,
        }
    }

    pub fn parse(s: &str) -> Option<EntityKind> {
        match s {
            "community" | "communities" => Some(EntityKind::Community),
            "user" | "users" => Some(EntityKind::User),
            "channel" | "channels" => Some(EntityKind::Channel),
            "role" | "roles" => Some(EntityKind::Role),
            _ => None,
        }
    }
}

/// Logical name dependent tables use to reference a mirrored entity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKey {
    User,
    Channel,
    Community,
    Role,
}

impl ColumnKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnKey::User => "user",
            ColumnKey::Channel => "channel",
            ColumnKey::Community => "community",
            ColumnKey::Role => "role",
        }
    }

    /// Referencing column in dependent tables, e.g. `user_id`.
    pub fn column_name(&self) -> String {
        format!("{}_id", self.as_str())
    }
}

/// One unit of cross-table cleanup: purge every row whose `{key}_id` is `id`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CleanupRequest {
    pub key: ColumnKey,
    pub id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Community {
    pub id: i64,
    pub category_type: CategoryType,
    pub client_id: ClientId,
    pub batch_status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub category_type: CategoryType,
    pub client_id: ClientId,
    pub community_id: i64,
    pub batch_status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Channel {
    pub id: i64,
    pub category_type: CategoryType,
    pub client_id: ClientId,
    pub community_id: i64,
    pub channel_type: ChannelType,
    pub batch_status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Role {
    pub id: i64,
    pub category_type: CategoryType,
    pub client_id: ClientId,
    pub community_id: i64,
    pub batch_status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Insert payload shared by every entity kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntity {
    pub category_type: CategoryType,
    pub client_id: ClientId,
    pub community_id: Option<i64>,
    pub channel_type: Option<ChannelType>,
}

impl NewEntity {
    pub fn community(category_type: CategoryType, client_id: ClientId) -> Self {
        Self {
            category_type,
            client_id,
            community_id: None,
            channel_type: None,
        }
    }

    /// A User or Role row inside `community_id`.
    pub fn scoped(category_type: CategoryType, client_id: ClientId, community_id: i64) -> Self {
        Self {
            category_type,
            client_id,
            community_id: Some(community_id),
            channel_type: None,
        }
    }

    pub fn channel(
        category_type: CategoryType,
        client_id: ClientId,
        community_id: i64,
        channel_type: ChannelType,
    ) -> Self {
        Self {
            category_type,
            client_id,
            community_id: Some(community_id),
            channel_type: Some(channel_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dm_channels_are_not_mirrored() {
        assert_eq!(ChannelType::from_platform(1), None);
        assert_eq!(ChannelType::from_platform(3), None);
    }

    #[test]
    fn guild_channel_tags_map_to_local_types() {
        assert_eq!(ChannelType::from_platform(0), Some(ChannelType::Text));
        assert_eq!(ChannelType::from_platform(2), Some(ChannelType::Voice));
        assert_eq!(ChannelType::from_platform(13), Some(ChannelType::Voice));
        assert_eq!(ChannelType::from_platform(4), Some(ChannelType::Category));
        assert_eq!(ChannelType::from_platform(5), Some(ChannelType::Announcement));
        assert_eq!(ChannelType::from_platform(15), Some(ChannelType::Forum));
        assert_eq!(ChannelType::from_platform(11), Some(ChannelType::PublicThread));
        assert_eq!(ChannelType::from_platform(12), Some(ChannelType::PrivateThread));
        assert_eq!(ChannelType::from_platform(14), Some(ChannelType::Other));
        assert_eq!(ChannelType::from_platform(200), Some(ChannelType::Other));
    }

    #[test]
    fn column_key_follows_id_suffix_convention() {
        assert_eq!(ColumnKey::User.column_name(), "user_id");
        assert_eq!(ColumnKey::Community.column_name(), "community_id");
        assert_eq!(EntityKind::Channel.column_key().column_name(), "channel_id");
    }

    #[test]
    fn batch_status_names() {
        assert_eq!(BatchStatus::Yet.as_str(), "yet");
        assert_eq!(BatchStatus::Done.as_str(), "done");
    }

    #[test]
    fn entity_kind_parse_accepts_singular_and_table_names() {
        assert_eq!(EntityKind::parse("user"), Some(EntityKind::User));
        assert_eq!(EntityKind::parse("communities"), Some(EntityKind::Community));
        assert_eq!(EntityKind::parse("guild"), None);
    }
}
