//! Cascade consistency engine. Deleting an entity must not leave dangling
//! references visible to readers, and cross-row consequences are never
//! delegated to the schema, so every cascade is an ordered sequence of
//! independently idempotent statements. A caller that hits a transient
//! failure can re-run the whole sequence; completed steps degrade to no-ops.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ApiError;
use crate::sharing::{bare_filter, member_filter};

/// Clears the tag reference on every event pointing at one of `tag_ids`.
/// Events are detached, never deleted with their tag.
pub async fn detach_events_for_tags(db: &PgPool, tag_ids: &[Uuid]) -> Result<(), ApiError> {
    if tag_ids.is_empty() {
        return Ok(());
    }
    sqlx::query("UPDATE events SET tag_id = NULL WHERE tag_id = ANY($1)")
        .bind(tag_ids)
        .execute(db)
        .await?;
    Ok(())
}

/// Removes the user's membership entry from every board they do not own.
/// A single statement rebuilds each matching members array server-side, so
/// a concurrent grant on an unrelated board is never overwritten.
pub async fn strip_board_memberships(db: &PgPool, user_id: Uuid) -> Result<(), ApiError> {
    sqlx::query(
        "UPDATE boards SET members = (
             SELECT COALESCE(jsonb_agg(entry), '[]'::jsonb)
             FROM jsonb_array_elements(members) AS entry
             WHERE entry ->> 'userId' IS DISTINCT FROM $1
         )
         WHERE members @> $2",
    )
    .bind(user_id.to_string())
    .bind(member_filter(user_id))
    .execute(db)
    .await?;
    Ok(())
}

/// Removes the user's entries from every tag's share list, matching both the
/// object shape and legacy bare-id entries in one statement. Entries for
/// other users keep whatever shape they were stored in.
pub async fn strip_tag_shares(db: &PgPool, user_id: Uuid) -> Result<(), ApiError> {
    sqlx::query(
        "UPDATE tags SET shared_with = (
             SELECT COALESCE(jsonb_agg(entry), '[]'::jsonb)
             FROM jsonb_array_elements(shared_with) AS entry
             WHERE entry ->> 'userId' IS DISTINCT FROM $1
               AND entry #>> '{}' IS DISTINCT FROM $1
         )
         WHERE shared_with @> $2 OR shared_with @> $3",
    )
    .bind(user_id.to_string())
    .bind(member_filter(user_id))
    .bind(bare_filter(user_id))
    .execute(db)
    .await?;
    Ok(())
}

/// One step of the account-deletion cascade. The fixed sequence below is
/// the ordering contract: no step depends on a step after it, events detach
/// while the owned tag ids still resolve, and the user row goes last so a
/// re-run converges with `NotFound` there and no error anywhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeStep {
    DeleteOwnedBoards,
    StripBoardMemberships,
    DetachEventsFromOwnedTags,
    DeleteOwnedTags,
    StripTagShares,
    DeleteOwnedEvents,
    DeleteInvites,
    DeleteTransactions,
    DeleteNotifications,
    DeleteUser,
}

pub const CASCADE_STEPS: [CascadeStep; 10] = [
    CascadeStep::DeleteOwnedBoards,
    CascadeStep::StripBoardMemberships,
    CascadeStep::DetachEventsFromOwnedTags,
    CascadeStep::DeleteOwnedTags,
    CascadeStep::StripTagShares,
    CascadeStep::DeleteOwnedEvents,
    CascadeStep::DeleteInvites,
    CascadeStep::DeleteTransactions,
    CascadeStep::DeleteNotifications,
    CascadeStep::DeleteUser,
];

async fn run_cascade_step(db: &PgPool, user_id: Uuid, step: CascadeStep) -> Result<(), ApiError> {
    match step {
        CascadeStep::DeleteOwnedBoards => {
            sqlx::query("DELETE FROM boards WHERE owner_id = $1")
                .bind(user_id)
                .execute(db)
                .await?;
        }
        CascadeStep::StripBoardMemberships => strip_board_memberships(db, user_id).await?,
        CascadeStep::DetachEventsFromOwnedTags => {
            sqlx::query(
                "UPDATE events SET tag_id = NULL
                 WHERE tag_id IN (SELECT id FROM tags WHERE owner_id = $1)",
            )
            .bind(user_id)
            .execute(db)
            .await?;
        }
        CascadeStep::DeleteOwnedTags => {
            sqlx::query("DELETE FROM tags WHERE owner_id = $1")
                .bind(user_id)
                .execute(db)
                .await?;
        }
        CascadeStep::StripTagShares => strip_tag_shares(db, user_id).await?,
        CascadeStep::DeleteOwnedEvents => {
            sqlx::query("DELETE FROM events WHERE user_id = $1")
                .bind(user_id)
                .execute(db)
                .await?;
        }
        CascadeStep::DeleteInvites => {
            sqlx::query("DELETE FROM invites WHERE sender_id = $1 OR recipient_id = $1")
                .bind(user_id)
                .execute(db)
                .await?;
        }
        CascadeStep::DeleteTransactions => {
            sqlx::query("DELETE FROM transactions WHERE user_id = $1")
                .bind(user_id)
                .execute(db)
                .await?;
        }
        CascadeStep::DeleteNotifications => {
            sqlx::query("DELETE FROM notifications WHERE user_id = $1")
                .bind(user_id)
                .execute(db)
                .await?;
        }
        CascadeStep::DeleteUser => {
            let deleted = sqlx::query("DELETE FROM users WHERE id = $1")
                .bind(user_id)
                .execute(db)
                .await?;
            if deleted.rows_affected() == 0 {
                return Err(ApiError::NotFound("User not found"));
            }
        }
    }
    Ok(())
}

/// Deletes a user account and everything hanging off it, running the fixed
/// `CASCADE_STEPS` sequence in order.
pub async fn delete_user_cascade(db: &PgPool, user_id: Uuid) -> Result<(), ApiError> {
    log::info!("running account deletion cascade for user {}", user_id);
    for step in CASCADE_STEPS {
        run_cascade_step(db, user_id, step).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(step: CascadeStep) -> usize {
        CASCADE_STEPS
            .iter()
            .position(|s| *s == step)
            .expect("step missing from sequence")
    }

    #[test]
    fn cascade_covers_every_entity_exactly_once() {
        assert_eq!(CASCADE_STEPS.len(), 10);
        for step in CASCADE_STEPS {
            assert_eq!(CASCADE_STEPS.iter().filter(|s| **s == step).count(), 1);
        }
    }

    #[test]
    fn cascade_order_is_fixed() {
        assert_eq!(
            CASCADE_STEPS,
            [
                CascadeStep::DeleteOwnedBoards,
                CascadeStep::StripBoardMemberships,
                CascadeStep::DetachEventsFromOwnedTags,
                CascadeStep::DeleteOwnedTags,
                CascadeStep::StripTagShares,
                CascadeStep::DeleteOwnedEvents,
                CascadeStep::DeleteInvites,
                CascadeStep::DeleteTransactions,
                CascadeStep::DeleteNotifications,
                CascadeStep::DeleteUser,
            ]
        );
    }

    #[test]
    fn events_detach_while_owned_tag_ids_still_resolve() {
        assert!(
            position(CascadeStep::DetachEventsFromOwnedTags)
                < position(CascadeStep::DeleteOwnedTags)
        );
    }

    #[test]
    fn owned_boards_go_before_membership_strips() {
        assert!(
            position(CascadeStep::DeleteOwnedBoards)
                < position(CascadeStep::StripBoardMemberships)
        );
    }

    #[test]
    fn user_row_goes_last_so_reruns_converge() {
        assert_eq!(position(CascadeStep::DeleteUser), CASCADE_STEPS.len() - 1);
    }
}
