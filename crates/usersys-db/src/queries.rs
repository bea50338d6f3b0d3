use crate::Database;
use crate::models::UserRow;
use anyhow::{Context, Result, bail};
use chrono::Utc;
use rusqlite::{Connection, Row};
use tracing::info;

/// Rows inserted per transaction while seeding.
const SEED_BATCH_SIZE: u64 = 10_000;

const USER_COLUMNS: &str =
    "id, username, password_hash, nickname, profile_pic, created_at, updated_at";

impl Database {
    // -- Users --

    /// Insert a user and return its id.
    pub fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        nickname: &str,
        profile_pic: &str,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO users (username, password_hash, nickname, profile_pic, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                rusqlite::params![username, password_hash, nickname, profile_pic, now],
            )
            .with_context(|| format!("insert user {}", username))?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", &username))
    }

    pub fn get_user_by_id(&self, id: i64) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", &id))
    }

    /// Overwrite the two mutable profile fields. Errors if the user is gone.
    pub fn update_user_profile(&self, id: i64, nickname: &str, profile_pic: &str) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET nickname = ?1, profile_pic = ?2, updated_at = ?3 WHERE id = ?4",
                rusqlite::params![nickname, profile_pic, Utc::now(), id],
            )?;
            if changed == 0 {
                bail!("User not found: {}", id);
            }
            Ok(())
        })
    }

    pub fn count_users(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
            Ok(count as u64)
        })
    }

    // -- Seeding --

    /// Insert `count` test users named `user_1..=user_<count>`, all sharing
    /// `password_hash`. Commits every `SEED_BATCH_SIZE` rows.
    pub fn seed_users(&self, count: u64, password_hash: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            let mut next = 1;
            while next <= count {
                let last = (next + SEED_BATCH_SIZE - 1).min(count);
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO users (username, password_hash, nickname, profile_pic, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    )?;
                    let now = Utc::now();
                    for i in next..=last {
                        stmt.execute(rusqlite::params![
                            format!("user_{}", i),
                            password_hash,
                            format!("User {}", i),
                            format!("https://example.com/avatar/{}.jpg", i),
                            now,
                        ])?;
                    }
                }
                tx.commit()?;
                info!("Seeded {} users...", last);
                next = last + 1;
            }
            Ok(())
        })
    }
}

// `column` is always one of our own literals, never caller input.
fn query_user(
    conn: &Connection,
    column: &str,
    value: &dyn rusqlite::ToSql,
) -> Result<Option<UserRow>> {
    let sql = format!("SELECT {} FROM users WHERE {} = ?1", USER_COLUMNS, column);
    let mut stmt = conn.prepare(&sql)?;
    let row = stmt.query_row([value], map_user).optional()?;
    Ok(row)
}

fn map_user(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        nickname: row.get(3)?,
        profile_pic: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
