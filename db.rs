use crate::error::{Error, Result};
use crate::models::{Media, MediaType, User};
use crate::schema;
use chrono::{DateTime, Utc};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::Path;
use std::time::Duration;

pub type DbPool = r2d2::Pool<SqliteConnectionManager>;
pub type DbConnection = r2d2::PooledConnection<SqliteConnectionManager>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Initializes the database connection pool and runs migrations.
pub fn init_database(db_path: &Path) -> Result<DbPool> {
    log::info!("Database path: {}", db_path.display());

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| Error::io_at(parent, err))?;
    }

    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
    });
    let pool = r2d2::Pool::new(manager)?;

    run_migrations(&pool.get()?)?;

    Ok(pool)
}

/// Applies all pending database migrations.
fn run_migrations(connection: &DbConnection) -> Result<()> {
    let connection: &Connection = connection;

    log::info!("Running database migrations...");
    connection.execute_batch(schema::MIGRATION_0001)?;
    log::info!("Migrations applied successfully.");
    Ok(())
}

/// Runs `f` inside one transaction, committing only when it succeeds.
pub fn in_transaction<T>(
    conn: &mut Connection,
    f: impl FnOnce(&Transaction<'_>) -> Result<T>,
) -> Result<T> {
    let tx = conn.transaction()?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

// Users and ownership

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        admin: row.get(2)?,
    })
}

pub fn create_user(conn: &Connection, username: &str, admin: bool) -> Result<User> {
    conn.execute(
        "INSERT INTO users (username, admin) VALUES (?1, ?2)",
        params![username, admin],
    )?;
    Ok(User {
        id: conn.last_insert_rowid(),
        username: username.to_string(),
        admin,
    })
}

pub fn find_user_by_name(conn: &Connection, username: &str) -> Result<Option<User>> {
    let user = conn
        .query_row(
            "SELECT id, username, admin FROM users WHERE username = ?1",
            [username],
            user_from_row,
        )
        .optional()?;
    Ok(user)
}

pub fn find_user(conn: &Connection, user_id: i64) -> Result<Option<User>> {
    let user = conn
        .query_row(
            "SELECT id, username, admin FROM users WHERE id = ?1",
            [user_id],
            user_from_row,
        )
        .optional()?;
    Ok(user)
}

pub fn list_users(conn: &Connection) -> Result<Vec<User>> {
    let mut stmt = conn.prepare("SELECT id, username, admin FROM users ORDER BY id")?;
    let users = stmt
        .query_map([], user_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(users)
}

pub fn album_owners(conn: &Connection, album_id: i64) -> Result<Vec<i64>> {
    let mut stmt =
        conn.prepare("SELECT user_id FROM user_albums WHERE album_id = ?1 ORDER BY user_id")?;
    let owners = stmt
        .query_map([album_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(owners)
}

pub fn is_album_owner(conn: &Connection, album_id: i64, user_id: i64) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM user_albums WHERE album_id = ?1 AND user_id = ?2",
            params![album_id, user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn add_album_owner(conn: &Connection, album_id: i64, user_id: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO user_albums (user_id, album_id) VALUES (?1, ?2)",
        params![user_id, album_id],
    )?;
    Ok(())
}

/// Removes the ownership links and then the album rows, inside the caller's transaction.
pub fn delete_albums(conn: &Connection, album_ids: &[i64]) -> Result<()> {
    let mut unlink = conn.prepare("DELETE FROM user_albums WHERE album_id = ?1")?;
    for id in album_ids {
        unlink.execute([id])?;
    }
    let mut delete = conn.prepare("DELETE FROM albums WHERE id = ?1")?;
    for id in album_ids {
        delete.execute([id])?;
    }
    Ok(())
}

// Media

pub(crate) const MEDIA_COLUMNS: &str = "id, title, path, path_hash, album_id, type, date_shot";

pub(crate) fn media_from_row(row: &Row<'_>) -> rusqlite::Result<Media> {
    let kind: String = row.get(5)?;
    let media_type = MediaType::parse(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("unknown media type {kind}").into(),
        )
    })?;
    let date_shot: i64 = row.get(6)?;
    Ok(Media {
        id: row.get(0)?,
        title: row.get(1)?,
        path: row.get(2)?,
        path_hash: row.get(3)?,
        album_id: row.get(4)?,
        media_type,
        date_shot: DateTime::<Utc>::from_timestamp(date_shot, 0).unwrap_or_default(),
    })
}

pub fn find_media_by_fingerprint(conn: &Connection, path_hash: &str) -> Result<Option<Media>> {
    let media = conn
        .query_row(
            &format!("SELECT {MEDIA_COLUMNS} FROM media WHERE path_hash = ?1"),
            [path_hash],
            media_from_row,
        )
        .optional()?;
    Ok(media)
}

pub fn find_media(conn: &Connection, media_id: i64) -> Result<Option<Media>> {
    let media = conn
        .query_row(
            &format!("SELECT {MEDIA_COLUMNS} FROM media WHERE id = ?1"),
            [media_id],
            media_from_row,
        )
        .optional()?;
    Ok(media)
}

pub fn album_media(conn: &Connection, album_id: i64) -> Result<Vec<Media>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MEDIA_COLUMNS} FROM media WHERE album_id = ?1 ORDER BY id"
    ))?;
    let media = stmt
        .query_map([album_id], media_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(media)
}

pub struct NewMedia<'a> {
    pub title: &'a str,
    pub path: &'a str,
    pub path_hash: &'a str,
    pub album_id: i64,
    pub media_type: MediaType,
    pub date_shot: DateTime<Utc>,
}

pub fn insert_media(conn: &Connection, media: NewMedia<'_>) -> Result<Media> {
    conn.execute(
        "INSERT INTO media (title, path, path_hash, album_id, type, date_shot)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            media.title,
            media.path,
            media.path_hash,
            media.album_id,
            media.media_type.as_str(),
            media.date_shot.timestamp()
        ],
    )?;
    Ok(Media {
        id: conn.last_insert_rowid(),
        title: media.title.to_string(),
        path: media.path.to_string(),
        path_hash: media.path_hash.to_string(),
        album_id: media.album_id,
        media_type: media.media_type,
        date_shot: media.date_shot,
    })
}

pub fn update_media_location(conn: &Connection, media_id: i64, title: &str, path: &str) -> Result<()> {
    conn.execute(
        "UPDATE media SET title = ?1, path = ?2 WHERE id = ?3",
        params![title, path, media_id],
    )?;
    Ok(())
}

pub fn delete_media(conn: &Connection, media_ids: &[i64]) -> Result<()> {
    let mut stmt = conn.prepare("DELETE FROM media WHERE id = ?1")?;
    for id in media_ids {
        stmt.execute([id])?;
    }
    Ok(())
}

/// Counts rows of a catalog table; used by diagnostics and tests.
pub fn count_rows(conn: &Connection, table: &str) -> Result<i64> {
    let allowed = ["users", "albums", "user_albums", "media"];
    if !allowed.contains(&table) {
        return Err(Error::Path(format!("unknown table {table}")));
    }
    let count = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
    Ok(count)
}
