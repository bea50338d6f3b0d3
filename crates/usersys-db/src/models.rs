use chrono::{DateTime, Utc};
use usersys_protocol::UserProfile;

/// A row of the `users` table, password hash included.
/// Distinct from the wire `UserProfile` so the hash never leaves this layer
/// by accident.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub nickname: String,
    pub profile_pic: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRow {
    pub fn to_profile(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            username: self.username.clone(),
            nickname: self.nickname.clone(),
            profile_pic: self.profile_pic.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}
