use crate::models::schema::{documents, suggestions};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, DbEnum)]
#[ExistingTypePath = "crate::models::schema::sql_types::DocumentKind"]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Text,
    Code,
}

// ============================================================================
// Documents
// ============================================================================

/// One version of a document. Versions share `id` and are ordered by
/// `created_at`.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone, Serialize, Deserialize)]
#[diesel(table_name = documents)]
#[diesel(primary_key(id, created_at))]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub kind: DocumentKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = documents)]
pub struct NewDocument {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub kind: DocumentKind,
    pub content: String,
}

impl Document {
    /// Latest version of the document, if any.
    pub fn get_latest_by_id(
        conn: &mut PgConnection,
        id: Uuid,
    ) -> Result<Option<Document>, DocumentError> {
        documents::table
            .filter(documents::id.eq(id))
            .order(documents::created_at.desc())
            .first::<Document>(conn)
            .optional()
            .map_err(DocumentError::DatabaseError)
    }
}

impl NewDocument {
    pub fn insert(&self, conn: &mut PgConnection) -> Result<Document, DocumentError> {
        diesel::insert_into(documents::table)
            .values(self)
            .get_result(conn)
            .map_err(DocumentError::DatabaseError)
    }
}

// ============================================================================
// Suggestions
// ============================================================================

/// Proposed edit attached to a specific document version.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone, Serialize, Deserialize)]
#[diesel(table_name = suggestions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub id: Uuid,
    pub document_id: Uuid,
    pub document_created_at: DateTime<Utc>,
    pub user_id: Uuid,
    pub original_text: String,
    pub suggested_text: String,
    pub description: Option<String>,
    pub is_resolved: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = suggestions)]
pub struct NewSuggestion {
    pub id: Uuid,
    pub document_id: Uuid,
    pub document_created_at: DateTime<Utc>,
    pub user_id: Uuid,
    pub original_text: String,
    pub suggested_text: String,
    pub description: Option<String>,
}

impl NewSuggestion {
    pub fn insert_all(
        conn: &mut PgConnection,
        rows: &[NewSuggestion],
    ) -> Result<Vec<Suggestion>, DocumentError> {
        diesel::insert_into(suggestions::table)
            .values(rows)
            .get_results(conn)
            .map_err(DocumentError::DatabaseError)
    }
}
