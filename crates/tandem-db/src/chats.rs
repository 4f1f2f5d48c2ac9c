use crate::{DbError, DbPool};

/// The two users of the match behind `chat_id`, or `None` when the chat does
/// not exist or its match is no longer active.
pub async fn active_chat_participants(
    pool: &DbPool,
    chat_id: &str,
) -> Result<Option<(String, String)>, DbError> {
    // Casts keep uuid-typed columns readable through the Any driver.
    let row = sqlx::query_as::<_, (String, String)>(
        "SELECT CAST(m.user1_id AS TEXT), CAST(m.user2_id AS TEXT)
         FROM chats c
         JOIN matches m ON c.match_id = m.id
         WHERE CAST(c.id AS TEXT) = $1 AND m.is_active = true",
    )
    .bind(chat_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}
