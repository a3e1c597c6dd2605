//! Row shapes returned by the repository queries.
//!
//! Keep these structs focused on the data returned by queries. Conversion
//! into domain types lives with the callers.

/// One row of the `repositories` table. `last_update` is epoch seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRow {
    pub id: String,
    pub last_tag: Option<String>,
    pub last_update: Option<i64>,
}

/// One pending release notification in the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessageRow {
    pub id: i64,
    pub payload: String,
    pub attempt: i32,
}
