use crate::db;
use crate::errors::{Error, Result};
use crate::metrics::{
    DUPLICATE_VOTES_TOTAL, RESETS_TRIGGERED_TOTAL, RESET_COMMANDS_CONSUMED_TOTAL,
    SESSIONS_CREATED_TOTAL, VOTES_TOTAL, VOTE_LATENCY_SECONDS,
};
use crate::model::{AnnotatedVote, ResetCommand, ResetSession, ResetStatus, VoteOutcome};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info};

const SESSION_COLUMNS: &str =
    "id, device_id, status, required_votes, votes_received, created_at, expires_at, executed_at";

/// Admits one user's vote toward resetting a device's energy counters.
///
/// The whole operation runs in a single transaction: session
/// find-or-create, vote insert, ledger recount, count persist, and the
/// quorum transition. A duplicate vote is detected by the ledger's
/// uniqueness constraint rejecting the insert, never by a prior read.
pub async fn cast_vote(pool: &PgPool, device_id: &str, user_id: &str) -> Result<VoteOutcome> {
    let _timer = VOTE_LATENCY_SECONDS.start_timer();

    let device = db::get_device(pool, device_id).await?;

    let mut tx = pool.begin().await?;

    let session = match active_session(&mut tx, device_id).await? {
        Some(session) => session,
        None => {
            debug!("No active session for {}, creating one", device_id);
            create_session(&mut tx, device_id, device.channel_count).await?
        }
    };

    let inserted = sqlx::query("INSERT INTO reset_votes (device_id, user_id) VALUES ($1, $2)")
        .bind(device_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await;

    if let Err(e) = inserted {
        if is_unique_violation(&e) {
            DUPLICATE_VOTES_TOTAL.inc();
            return Err(Error::AlreadyVoted);
        }
        return Err(e.into());
    }

    // Recount from the ledger rather than incrementing; the stored count
    // is self-correcting and the surrounding transaction closes the
    // read-count-write window.
    let votes_received: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM reset_votes WHERE device_id = $1")
            .bind(device_id)
            .fetch_one(&mut *tx)
            .await?;

    sqlx::query("UPDATE reset_sessions SET votes_received = $1 WHERE id = $2")
        .bind(votes_received as i32)
        .bind(session.id)
        .execute(&mut *tx)
        .await?;

    let mut reset_triggered = false;
    if votes_received >= i64::from(session.required_votes) {
        // Guarded transition: a session already executing is not re-armed,
        // so the quorum event fires at most once per session.
        let transitioned = sqlx::query(
            "UPDATE reset_sessions SET status = 'executing', executed_at = NOW() \
             WHERE id = $1 AND status = 'voting'",
        )
        .bind(session.id)
        .execute(&mut *tx)
        .await?;

        reset_triggered = transitioned.rows_affected() == 1;
        if reset_triggered {
            RESETS_TRIGGERED_TOTAL.inc();
            info!(
                "Energy reset triggered for device {} with {} votes",
                device_id, votes_received
            );
        }
    }

    tx.commit().await?;
    VOTES_TOTAL.inc();

    Ok(VoteOutcome {
        success: true,
        votes_received,
        required_votes: session.required_votes,
        reset_triggered,
    })
}

/// Reports the active session, the full annotated vote list, and the
/// quorum arithmetic for a device. Side-effect-free.
pub async fn reset_status(pool: &PgPool, device_id: &str) -> Result<ResetStatus> {
    let device = db::get_device(pool, device_id).await?;

    let session = sqlx::query_as::<_, ResetSession>(&format!(
        "SELECT {SESSION_COLUMNS} FROM reset_sessions \
         WHERE device_id = $1 AND status = 'voting' AND expires_at > NOW() \
         ORDER BY created_at DESC LIMIT 1"
    ))
    .bind(device_id)
    .fetch_optional(pool)
    .await?;

    let votes = sqlx::query_as::<_, AnnotatedVote>(
        "SELECT v.user_id, v.voted_at, p.full_name \
         FROM reset_votes v \
         LEFT JOIN profiles p ON p.user_id = v.user_id \
         WHERE v.device_id = $1 \
         ORDER BY v.voted_at",
    )
    .bind(device_id)
    .fetch_all(pool)
    .await?;

    let votes_received = votes.len() as i64;

    Ok(ResetStatus {
        session,
        votes,
        required_votes: device.channel_count,
        votes_received,
    })
}

/// Polled by the embedded device. Consumes an `executing` session:
/// marks it completed and clears the device's votes so the next voting
/// cycle starts clean. Returns the reset signal at most once per session.
pub async fn check_and_consume(pool: &PgPool, device_id: &str) -> Result<ResetCommand> {
    let mut tx = pool.begin().await?;

    let claimed = sqlx::query(
        "UPDATE reset_sessions SET status = 'completed' \
         WHERE device_id = $1 AND status = 'executing'",
    )
    .bind(device_id)
    .execute(&mut *tx)
    .await?;

    if claimed.rows_affected() == 0 {
        return Ok(ResetCommand {
            reset_command: false,
            message: None,
        });
    }

    // The only path that clears votes; a session that never reaches
    // quorum keeps its votes until its TTL passes.
    sqlx::query("DELETE FROM reset_votes WHERE device_id = $1")
        .bind(device_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    RESET_COMMANDS_CONSUMED_TOTAL.inc();
    info!("Reset command acknowledged by device {}", device_id);

    Ok(ResetCommand {
        reset_command: true,
        message: Some("Energy counters have been reset".to_string()),
    })
}

async fn active_session(
    tx: &mut Transaction<'_, Postgres>,
    device_id: &str,
) -> Result<Option<ResetSession>> {
    Ok(sqlx::query_as::<_, ResetSession>(&format!(
        "SELECT {SESSION_COLUMNS} FROM reset_sessions \
         WHERE device_id = $1 AND status = 'voting' AND expires_at > NOW() \
         ORDER BY created_at DESC LIMIT 1"
    ))
    .bind(device_id)
    .fetch_optional(&mut **tx)
    .await?)
}

async fn create_session(
    tx: &mut Transaction<'_, Postgres>,
    device_id: &str,
    required_votes: i32,
) -> Result<ResetSession> {
    let session = sqlx::query_as::<_, ResetSession>(&format!(
        "INSERT INTO reset_sessions (device_id, required_votes) VALUES ($1, $2) \
         RETURNING {SESSION_COLUMNS}"
    ))
    .bind(device_id)
    .bind(required_votes)
    .fetch_one(&mut **tx)
    .await?;

    SESSIONS_CREATED_TOTAL.inc();
    Ok(session)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}
