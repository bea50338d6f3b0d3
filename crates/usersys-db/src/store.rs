use anyhow::Result;

use crate::Database;
use crate::models::UserRow;

/// What the request dispatcher needs from persistent user storage.
///
/// Each call is expected to be at least single-row atomic. Nothing here
/// spans rows or calls.
pub trait UserStore: Send + Sync {
    fn find_by_username(&self, username: &str) -> Result<Option<UserRow>>;

    fn find_by_id(&self, id: i64) -> Result<Option<UserRow>>;

    fn update_profile(&self, id: i64, nickname: &str, profile_pic: &str) -> Result<()>;
}

impl UserStore for Database {
    fn find_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.get_user_by_username(username)
    }

    fn find_by_id(&self, id: i64) -> Result<Option<UserRow>> {
        self.get_user_by_id(id)
    }

    fn update_profile(&self, id: i64, nickname: &str, profile_pic: &str) -> Result<()> {
        self.update_user_profile(id, nickname, profile_pic)
    }
}
