use crate::models::schema::users;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum UserError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
    #[error("User with this email already exists")]
    DuplicateEmail,
    #[error("User not found")]
    NotFound,
}

/// Account tier; selects the entitlement row used by the quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, DbEnum)]
#[ExistingTypePath = "crate::models::schema::sql_types::UserType"]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    Guest,
    Regular,
}

#[derive(Queryable, Selectable, Identifiable, Serialize, Deserialize, Clone)]
#[diesel(table_name = users)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub user_type: UserType,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("password_hash", &"<redacted>")
            .field("user_type", &self.user_type)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl User {
    pub fn get_by_id(conn: &mut PgConnection, id: Uuid) -> Result<User, UserError> {
        users::table
            .filter(users::id.eq(id))
            .first::<User>(conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => UserError::NotFound,
                _ => UserError::DatabaseError(e),
            })
    }

    pub fn get_by_email(conn: &mut PgConnection, email: &str) -> Result<Option<User>, UserError> {
        users::table
            .filter(users::email.eq(email))
            .first::<User>(conn)
            .optional()
            .map_err(UserError::DatabaseError)
    }
}

#[derive(Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Uuid,
    pub email: String,
    pub password_hash: Option<String>,
    pub user_type: UserType,
}

impl std::fmt::Debug for NewUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewUser")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("password_hash", &"<redacted>")
            .field("user_type", &self.user_type)
            .finish()
    }
}

impl NewUser {
    pub fn regular(email: String, password_hash: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            email,
            password_hash: Some(password_hash),
            user_type: UserType::Regular,
        }
    }

    /// Guests get a synthetic, unique email and no password.
    pub fn guest() -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            email: format!("guest-{}@guest.local", id.simple()),
            password_hash: None,
            user_type: UserType::Guest,
        }
    }

    pub fn insert(self, conn: &mut PgConnection) -> Result<User, UserError> {
        diesel::insert_into(users::table)
            .values(&self)
            .get_result(conn)
            .map_err(|e| match e {
                diesel::result::Error::DatabaseError(
                    diesel::result::DatabaseErrorKind::UniqueViolation,
                    _,
                ) => UserError::DuplicateEmail,
                _ => UserError::DatabaseError(e),
            })
    }
}
