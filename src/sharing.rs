//! Sharing core: role derivation, grant set semantics, invite transition
//! rules and the per-user shared-items report. Everything here is pure so the
//! consistency rules can be tested without a database; handlers and the
//! cascade are thin sequencing on top.

use std::collections::HashMap;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::auth::verify_session;
use crate::error::ApiError;
use crate::models::{Board, Grant, GrantEntry, InviteStatus, ItemType, Role, Tag};
use crate::AppState;

/// Effective role of a user on a board. The owner column always wins; a
/// member entry for the owning user (which should not exist) is ignored.
pub fn board_role(board: &Board, user_id: Uuid) -> Option<Role> {
    if board.owner_id == user_id {
        return Some(Role::Owner);
    }
    board
        .members
        .iter()
        .find(|grant| grant.user_id == user_id)
        .map(|grant| grant.role)
}

/// Effective role of a user on a tag, over the normalized grant list.
pub fn tag_role(tag: &Tag, user_id: Uuid) -> Option<Role> {
    if tag.owner_id == user_id {
        return Some(Role::Owner);
    }
    tag.shared_with
        .iter()
        .find(|grant| grant.user_id == user_id)
        .map(|grant| grant.role)
}

/// Permission check against an already-resolved resource. A missing resource
/// must be reported as `NotFound` by the caller before this runs; this only
/// ever answers `Forbidden`.
pub fn require_role(effective: Option<Role>, required: Role) -> Result<Role, ApiError> {
    match effective {
        Some(role) if role >= required => Ok(role),
        _ => Err(ApiError::Forbidden("Insufficient permissions")),
    }
}

/// Destructive operations (delete, unshare, remove member) are owner-only;
/// editor is deliberately insufficient.
pub fn require_owner(effective: Option<Role>) -> Result<(), ApiError> {
    match effective {
        Some(Role::Owner) => Ok(()),
        _ => Err(ApiError::Forbidden("Only the owner may do this")),
    }
}

/// Collapses stored entries (either shape) into normalized grants, dropping
/// duplicate user ids. First entry wins, matching add-if-absent semantics.
pub fn normalize_grants(entries: Vec<GrantEntry>) -> Vec<Grant> {
    let mut grants: Vec<Grant> = Vec::with_capacity(entries.len());
    for entry in entries {
        let grant = entry.into_grant();
        if !grants.iter().any(|existing| existing.user_id == grant.user_id) {
            grants.push(grant);
        }
    }
    grants
}

/// Add-if-absent. Returns whether the set changed, so callers can skip the
/// write-back on a repeated grant.
pub fn add_grant(grants: &mut Vec<Grant>, user_id: Uuid, role: Role) -> bool {
    if grants.iter().any(|grant| grant.user_id == user_id) {
        return false;
    }
    grants.push(Grant { user_id, role });
    true
}

/// Remove-by-user. Operates on the normalized list, so a user that was
/// present in either stored shape is pruned by a single call.
pub fn remove_grant(grants: &mut Vec<Grant>, user_id: Uuid) -> bool {
    let before = grants.len();
    grants.retain(|grant| grant.user_id != user_id);
    grants.len() != before
}

/// Invites transition once, out of `pending`, and never again. Re-resolving
/// a terminal invite is a deterministic conflict with no side effects.
pub fn check_pending(status: InviteStatus) -> Result<(), ApiError> {
    match status {
        InviteStatus::Pending => Ok(()),
        InviteStatus::Accepted | InviteStatus::Rejected => {
            Err(ApiError::Conflict("Invite already resolved"))
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserBrief {
    pub username: String,
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct Participant {
    #[serde(rename = "userId")]
    pub user_id: Uuid,
    pub username: String,
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Serialize)]
pub struct SharedItem {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ItemType,
    pub name: String,
    pub owned: bool,
    pub participants: Vec<Participant>,
}

/// Builds the shared-items report: every board/tag the requester owns or
/// participates in, with co-participants resolved to profile data, the
/// requester excluded from their own listing, and a synthesized leading
/// owner entry for items the requester does not own. Items with nobody else
/// involved are suppressed; the view exists to show shared work.
pub fn build_shared_report(
    requester: Uuid,
    boards: &[Board],
    tags: &[Tag],
    users: &HashMap<Uuid, UserBrief>,
) -> Vec<SharedItem> {
    let mut report = Vec::new();

    for board in boards {
        if let Some(item) = build_item(
            requester,
            board.id,
            ItemType::Board,
            board.title.clone(),
            board.owner_id,
            &board.members,
            users,
        ) {
            report.push(item);
        }
    }

    for tag in tags {
        if let Some(item) = build_item(
            requester,
            tag.id,
            ItemType::Tag,
            tag.name.clone(),
            tag.owner_id,
            &tag.shared_with,
            users,
        ) {
            report.push(item);
        }
    }

    report
}

fn build_item(
    requester: Uuid,
    id: Uuid,
    kind: ItemType,
    name: String,
    owner_id: Uuid,
    grants: &[Grant],
    users: &HashMap<Uuid, UserBrief>,
) -> Option<SharedItem> {
    let mut participants = Vec::new();

    // A non-owned item leads with the owner, unless some stale grant already
    // materializes them.
    if owner_id != requester && !grants.iter().any(|grant| grant.user_id == owner_id) {
        if let Some(brief) = users.get(&owner_id) {
            participants.push(Participant {
                user_id: owner_id,
                username: brief.username.clone(),
                email: brief.email.clone(),
                role: Role::Owner,
            });
        }
    }

    for grant in grants {
        if grant.user_id == requester {
            continue;
        }
        // Grants pointing at users that no longer resolve are skipped rather
        // than rendered as blanks.
        if let Some(brief) = users.get(&grant.user_id) {
            participants.push(Participant {
                user_id: grant.user_id,
                username: brief.username.clone(),
                email: brief.email.clone(),
                role: grant.role,
            });
        }
    }

    if participants.is_empty() {
        return None;
    }

    Some(SharedItem {
        id,
        kind,
        name,
        owned: owner_id == requester,
        participants,
    })
}

/// Containment filter matching a `{"userId": ...}` grant entry.
pub fn member_filter(user_id: Uuid) -> serde_json::Value {
    json!([{ "userId": user_id }])
}

/// Containment filter matching a legacy bare-id entry.
pub fn bare_filter(user_id: Uuid) -> serde_json::Value {
    json!([user_id])
}

pub async fn shared_items(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<Vec<SharedItem>>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;

    let board_rows = sqlx::query("SELECT * FROM boards WHERE owner_id = $1 OR members @> $2")
        .bind(user_id)
        .bind(member_filter(user_id))
        .fetch_all(&state.db)
        .await?;
    let boards = board_rows
        .iter()
        .map(Board::from_row)
        .collect::<Result<Vec<_>, _>>()?;

    let tag_rows = sqlx::query(
        "SELECT * FROM tags WHERE owner_id = $1 OR shared_with @> $2 OR shared_with @> $3",
    )
    .bind(user_id)
    .bind(member_filter(user_id))
    .bind(bare_filter(user_id))
    .fetch_all(&state.db)
    .await?;
    let tags = tag_rows
        .iter()
        .map(Tag::from_row)
        .collect::<Result<Vec<_>, _>>()?;

    // One batched lookup for every participant we might render.
    let mut wanted: Vec<Uuid> = Vec::new();
    for board in &boards {
        wanted.push(board.owner_id);
        wanted.extend(board.members.iter().map(|grant| grant.user_id));
    }
    for tag in &tags {
        wanted.push(tag.owner_id);
        wanted.extend(tag.shared_with.iter().map(|grant| grant.user_id));
    }
    wanted.sort_unstable();
    wanted.dedup();

    let user_rows = sqlx::query("SELECT id, username, email FROM users WHERE id = ANY($1)")
        .bind(&wanted)
        .fetch_all(&state.db)
        .await?;

    let mut users = HashMap::new();
    for row in &user_rows {
        use sqlx::Row;
        users.insert(
            row.try_get::<Uuid, _>("id")?,
            UserBrief {
                username: row.try_get("username")?,
                email: row.try_get("email")?,
            },
        );
    }

    Ok(Json(build_shared_report(user_id, &boards, &tags, &users)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn board(owner: Uuid, members: Vec<Grant>) -> Board {
        Board {
            id: Uuid::new_v4(),
            title: "Sprint".into(),
            slug: "sprint".into(),
            owner_id: owner,
            members,
            columns: serde_json::json!([]),
            updated_at: Utc::now(),
        }
    }

    fn tag(owner: Uuid, shared_with: Vec<Grant>) -> Tag {
        Tag {
            id: Uuid::new_v4(),
            name: "Work".into(),
            color: "#ff0000".into(),
            visible: true,
            owner_id: owner,
            shared_with,
        }
    }

    fn grant(user_id: Uuid, role: Role) -> Grant {
        Grant { user_id, role }
    }

    #[test]
    fn owner_precedence_over_member_entries() {
        let owner = Uuid::new_v4();
        // Even a bogus viewer entry for the owner must not demote them.
        let board = board(owner, vec![grant(owner, Role::Viewer)]);
        assert_eq!(board_role(&board, owner), Some(Role::Owner));

        let tag = tag(owner, vec![grant(owner, Role::Viewer)]);
        assert_eq!(tag_role(&tag, owner), Some(Role::Owner));
    }

    #[test]
    fn role_monotonicity_for_write_checks() {
        assert!(require_role(Some(Role::Owner), Role::Editor).is_ok());
        assert!(require_role(Some(Role::Editor), Role::Editor).is_ok());
        assert!(require_role(Some(Role::Viewer), Role::Editor).is_err());
        assert!(require_role(None, Role::Editor).is_err());

        assert!(require_role(Some(Role::Viewer), Role::Viewer).is_ok());
        assert!(require_role(None, Role::Viewer).is_err());
    }

    #[test]
    fn destructive_checks_need_owner_exactly() {
        assert!(require_owner(Some(Role::Owner)).is_ok());
        assert!(require_owner(Some(Role::Editor)).is_err());
        assert!(require_owner(Some(Role::Viewer)).is_err());
        assert!(require_owner(None).is_err());
    }

    #[test]
    fn absent_user_has_no_access() {
        let board = board(Uuid::new_v4(), vec![]);
        assert_eq!(board_role(&board, Uuid::new_v4()), None);
    }

    #[test]
    fn grant_add_is_idempotent() {
        let user = Uuid::new_v4();
        let mut grants = Vec::new();

        assert!(add_grant(&mut grants, user, Role::Editor));
        // Second accept of the same invite must not duplicate the entry nor
        // rewrite the role.
        assert!(!add_grant(&mut grants, user, Role::Viewer));
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].role, Role::Editor);
    }

    #[test]
    fn grants_from_different_actors_both_survive() {
        // Handlers mutate the members list only under a row lock, so two
        // actors granting different users apply to one copy in turn; the
        // second write must carry the first actor's grant, never erase it.
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();
        let mut grants = Vec::new();

        assert!(add_grant(&mut grants, user_a, Role::Editor));
        assert!(add_grant(&mut grants, user_b, Role::Viewer));

        assert_eq!(grants.len(), 2);
        assert!(grants.iter().any(|g| g.user_id == user_a));
        assert!(grants.iter().any(|g| g.user_id == user_b));
    }

    #[test]
    fn grant_remove_prunes_and_reports() {
        let user = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut grants = vec![grant(user, Role::Editor), grant(other, Role::Viewer)];

        assert!(remove_grant(&mut grants, user));
        assert!(!remove_grant(&mut grants, user));
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].user_id, other);
    }

    #[test]
    fn normalization_merges_shapes_and_dedups() {
        let user = Uuid::new_v4();
        let entries = vec![
            GrantEntry::Bare(user),
            GrantEntry::Full(grant(user, Role::Viewer)),
        ];
        let grants = normalize_grants(entries);
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].role, Role::Editor);
    }

    #[test]
    fn terminal_invites_stay_terminal() {
        assert!(check_pending(InviteStatus::Pending).is_ok());
        assert!(matches!(
            check_pending(InviteStatus::Accepted),
            Err(ApiError::Conflict(_))
        ));
        assert!(matches!(
            check_pending(InviteStatus::Rejected),
            Err(ApiError::Conflict(_))
        ));
    }

    #[test]
    fn report_suppresses_items_without_other_participants() {
        let me = Uuid::new_v4();
        let solo = board(me, vec![]);
        let users = HashMap::new();

        let report = build_shared_report(me, &[solo], &[], &users);
        assert!(report.is_empty());
    }

    #[test]
    fn report_lists_members_and_excludes_requester() {
        let me = Uuid::new_v4();
        let member = Uuid::new_v4();
        let shared = board(me, vec![grant(member, Role::Editor)]);

        let mut users = HashMap::new();
        users.insert(
            member,
            UserBrief {
                username: "vera".into(),
                email: "vera@example.com".into(),
            },
        );
        users.insert(
            me,
            UserBrief {
                username: "me".into(),
                email: "me@example.com".into(),
            },
        );

        let report = build_shared_report(me, &[shared], &[], &users);
        assert_eq!(report.len(), 1);
        assert!(report[0].owned);
        assert_eq!(report[0].participants.len(), 1);
        assert_eq!(report[0].participants[0].user_id, member);
    }

    #[test]
    fn report_synthesizes_owner_for_non_owned_items() {
        let me = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let shared = tag(owner, vec![grant(me, Role::Viewer)]);

        let mut users = HashMap::new();
        users.insert(
            owner,
            UserBrief {
                username: "olga".into(),
                email: "olga@example.com".into(),
            },
        );

        let report = build_shared_report(me, &[], &[shared], &users);
        assert_eq!(report.len(), 1);
        assert!(!report[0].owned);
        assert_eq!(report[0].participants[0].role, Role::Owner);
        assert_eq!(report[0].participants[0].user_id, owner);
    }
}
