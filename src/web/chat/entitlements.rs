//! Per-user-type daily message quota

use crate::config::AppConfig;
use crate::db::DBConnection;
use crate::models::users::UserType;
use crate::web::chat::constants::ENTITLEMENT_WINDOW_HOURS;
use crate::web::chat::errors::ChatError;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};
use uuid::Uuid;

/// Static quota table, one maximum per user type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entitlements {
    pub max_messages_guest: i64,
    pub max_messages_regular: i64,
}

impl Entitlements {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_messages_guest: config.max_messages_guest,
            max_messages_regular: config.max_messages_regular,
        }
    }

    pub fn max_messages_per_day(&self, user_type: UserType) -> i64 {
        match user_type {
            UserType::Guest => self.max_messages_guest,
            UserType::Regular => self.max_messages_regular,
        }
    }

    /// Counts user-role messages created strictly after `now - 24h` and
    /// denies once the count reaches the maximum.
    ///
    /// Not transactional: concurrent requests may each pass before either
    /// message is stored.
    pub fn check_quota(
        &self,
        db: &(dyn DBConnection + Send + Sync),
        user_id: Uuid,
        user_type: UserType,
        now: DateTime<Utc>,
    ) -> Result<(), ChatError> {
        let since = now - Duration::hours(ENTITLEMENT_WINDOW_HOURS);
        let count = db.count_user_messages_since(user_id, since)?;
        let max = self.max_messages_per_day(user_type);

        debug!(
            "User {} has sent {} of {} messages in the current window",
            user_id, count, max
        );

        if count >= max {
            info!("User {} exceeded daily message quota", user_id);
            return Err(ChatError::RateLimit);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chats::{MessageRole, NewChat, NewMessage, Visibility};
    use crate::test_utils::MemoryDb;
    use serde_json::json;

    const FIVE: Entitlements = Entitlements {
        max_messages_guest: 5,
        max_messages_regular: 5,
    };

    fn seed(db: &MemoryDb, user_id: Uuid, ages_in_hours: &[i64], now: DateTime<Utc>) {
        let chat_id = Uuid::new_v4();
        db.create_chat(NewChat {
            id: chat_id,
            user_id,
            title: "quota".to_string(),
            visibility: Visibility::Private,
        })
        .unwrap();
        let rows = ages_in_hours
            .iter()
            .map(|h| NewMessage {
                id: Uuid::new_v4(),
                chat_id,
                role: MessageRole::User,
                parts: json!([{"type": "text", "text": "hi"}]),
                attachments: json!([]),
                created_at: now - Duration::hours(*h),
            })
            .collect();
        db.save_messages(rows).unwrap();
    }

    #[test]
    fn test_denies_at_exact_maximum() {
        let db = MemoryDb::new();
        let user_id = Uuid::new_v4();
        let now = Utc::now();
        seed(&db, user_id, &[1, 2, 3, 4, 5], now);

        let result = FIVE.check_quota(&db, user_id, UserType::Regular, now);
        assert!(matches!(result, Err(ChatError::RateLimit)));
    }

    #[test]
    fn test_allows_when_older_message_leaves_window() {
        let db = MemoryDb::new();
        let user_id = Uuid::new_v4();
        let now = Utc::now();
        seed(&db, user_id, &[1, 2, 3, 4, 25], now);

        assert!(FIVE.check_quota(&db, user_id, UserType::Regular, now).is_ok());
    }

    #[test]
    fn test_message_exactly_24h_old_is_outside_window() {
        let db = MemoryDb::new();
        let user_id = Uuid::new_v4();
        let now = Utc::now();
        seed(&db, user_id, &[1, 2, 3, 4, 24], now);

        assert!(FIVE.check_quota(&db, user_id, UserType::Guest, now).is_ok());
    }

    #[test]
    fn test_assistant_messages_do_not_count() {
        let db = MemoryDb::new();
        let user_id = Uuid::new_v4();
        let now = Utc::now();
        seed(&db, user_id, &[1, 2, 3, 4], now);

        let chat_id = db.chats_for(user_id)[0];
        db.save_messages(vec![NewMessage {
            id: Uuid::new_v4(),
            chat_id,
            role: MessageRole::Assistant,
            parts: json!([{"type": "text", "text": "hello"}]),
            attachments: json!([]),
            created_at: now,
        }])
        .unwrap();

        assert!(FIVE.check_quota(&db, user_id, UserType::Regular, now).is_ok());
    }

    #[test]
    fn test_table_lookup_by_user_type() {
        let table = Entitlements {
            max_messages_guest: 20,
            max_messages_regular: 100,
        };
        assert_eq!(table.max_messages_per_day(UserType::Guest), 20);
        assert_eq!(table.max_messages_per_day(UserType::Regular), 100);
    }
}
