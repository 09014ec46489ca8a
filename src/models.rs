use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

/// Access level on a shared board or tag. Ordering matters: a write check is
/// `role >= Editor`, destructive operations require exactly `Owner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Editor,
    Owner,
}

impl Role {
    /// Parses a role a client may grant to someone else. `owner` is derived
    /// from the owning document and never grantable.
    pub fn parse_grantable(value: &str) -> Option<Role> {
        match value {
            "editor" => Some(Role::Editor),
            "viewer" => Some(Role::Viewer),
            _ => None,
        }
    }
}

fn default_grant_role() -> Role {
    Role::Editor
}

/// A normalized sharing grant: one non-owner user and their role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    #[serde(rename = "userId")]
    pub user_id: Uuid,
    #[serde(default = "default_grant_role")]
    pub role: Role,
}

/// Stored shape of a grant entry. Older tag documents hold bare user ids in
/// `shared_with`; everything written today is the full object form. Readers
/// accept both and normalize immediately rather than branching at use sites.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum GrantEntry {
    Full(Grant),
    Bare(Uuid),
}

impl GrantEntry {
    pub fn into_grant(self) -> Grant {
        match self {
            GrantEntry::Full(grant) => grant,
            GrantEntry::Bare(user_id) => Grant {
                user_id,
                role: Role::Editor,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Board,
    Tag,
}

impl ItemType {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemType::Board => "board",
            ItemType::Tag => "tag",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteStatus {
    Pending,
    Accepted,
    Rejected,
}

impl InviteStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InviteStatus::Pending => "pending",
            InviteStatus::Accepted => "accepted",
            InviteStatus::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<InviteStatus> {
        match value {
            "pending" => Some(InviteStatus::Pending),
            "accepted" => Some(InviteStatus::Accepted),
            "rejected" => Some(InviteStatus::Rejected),
            _ => None,
        }
    }
}

pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub profile_image: Option<String>,
}

impl User {
    pub fn from_row(row: &PgRow) -> Result<User, sqlx::Error> {
        Ok(User {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            email: row.try_get("email")?,
            password_hash: row.try_get("password_hash")?,
            profile_image: row.try_get("profile_image")?,
        })
    }
}

pub struct Board {
    pub id: Uuid,
    pub title: String,
    pub slug: String,
    pub owner_id: Uuid,
    pub members: Vec<Grant>,
    pub columns: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl Board {
    pub fn from_row(row: &PgRow) -> Result<Board, sqlx::Error> {
        let members: sqlx::types::Json<Vec<GrantEntry>> = row.try_get("members")?;
        Ok(Board {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            slug: row.try_get("slug")?,
            owner_id: row.try_get("owner_id")?,
            members: crate::sharing::normalize_grants(members.0),
            columns: row.try_get("columns")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

pub struct Tag {
    pub id: Uuid,
    pub name: String,
    pub color: String,
    pub visible: bool,
    pub owner_id: Uuid,
    pub shared_with: Vec<Grant>,
}

impl Tag {
    pub fn from_row(row: &PgRow) -> Result<Tag, sqlx::Error> {
        let shared: sqlx::types::Json<Vec<GrantEntry>> = row.try_get("shared_with")?;
        Ok(Tag {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            color: row.try_get("color")?,
            visible: row.try_get("visible")?,
            owner_id: row.try_get("owner_id")?,
            shared_with: crate::sharing::normalize_grants(shared.0),
        })
    }
}

pub struct Invite {
    pub id: Uuid,
    pub item_type: ItemType,
    pub item_id: Uuid,
    pub item_name: String,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub recipient_id: Uuid,
    pub role: Option<Role>,
    pub status: InviteStatus,
    pub created_at: DateTime<Utc>,
}

impl Invite {
    pub fn from_row(row: &PgRow) -> Result<Invite, sqlx::Error> {
        let item_type: String = row.try_get("item_type")?;
        let item_type = match item_type.as_str() {
            "board" => ItemType::Board,
            _ => ItemType::Tag,
        };
        let role: Option<String> = row.try_get("role")?;
        let status: String = row.try_get("status")?;

        Ok(Invite {
            id: row.try_get("id")?,
            item_type,
            item_id: row.try_get("item_id")?,
            item_name: row.try_get("item_name")?,
            sender_id: row.try_get("sender_id")?,
            sender_name: row.try_get("sender_name")?,
            recipient_id: row.try_get("recipient_id")?,
            role: role.as_deref().and_then(Role::parse_grantable),
            status: InviteStatus::parse(&status).unwrap_or(InviteStatus::Pending),
            created_at: row.try_get("created_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_ordering_matches_authority() {
        assert!(Role::Owner > Role::Editor);
        assert!(Role::Editor > Role::Viewer);
        assert!(Role::Editor >= Role::Editor);
    }

    #[test]
    fn owner_is_not_grantable() {
        assert_eq!(Role::parse_grantable("editor"), Some(Role::Editor));
        assert_eq!(Role::parse_grantable("viewer"), Some(Role::Viewer));
        assert_eq!(Role::parse_grantable("owner"), None);
        assert_eq!(Role::parse_grantable("admin"), None);
    }

    #[test]
    fn grant_entry_accepts_both_stored_shapes() {
        let user_id = Uuid::new_v4();

        let full: GrantEntry =
            serde_json::from_value(serde_json::json!({ "userId": user_id, "role": "viewer" }))
                .unwrap();
        assert_eq!(full.into_grant().role, Role::Viewer);

        let bare: GrantEntry = serde_json::from_value(serde_json::json!(user_id)).unwrap();
        let grant = bare.into_grant();
        assert_eq!(grant.user_id, user_id);
        assert_eq!(grant.role, Role::Editor);
    }

    #[test]
    fn grant_without_role_defaults_to_editor() {
        let user_id = Uuid::new_v4();
        let entry: GrantEntry =
            serde_json::from_value(serde_json::json!({ "userId": user_id })).unwrap();
        assert_eq!(entry.into_grant().role, Role::Editor);
    }
}
