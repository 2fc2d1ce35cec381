use chrono::NaiveDateTime;

/// One persisted message. `id` and `received_at` are assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub id: i32,
    pub client_id: i32,
    pub text: String,
    pub token: String,
    pub checksum: String,
    pub received_at: NaiveDateTime,
}
