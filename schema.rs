/// MIGRATION 0001: Catalog schema.
pub const MIGRATION_0001: &str = r#"
-- Users owning indexed trees.
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    admin BOOLEAN NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

-- Albums Table: one row per indexed directory.
CREATE TABLE IF NOT EXISTS albums (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    parent_album_id INTEGER,
    path TEXT NOT NULL,
    path_hash TEXT NOT NULL UNIQUE,
    cover_id INTEGER,
    last_modify_time INTEGER, -- Directory mtime as Unix timestamp
    last_last_modify_time INTEGER,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    FOREIGN KEY (parent_album_id) REFERENCES albums (id) ON DELETE SET NULL
);

-- Ownership links between users and albums.
CREATE TABLE IF NOT EXISTS user_albums (
    user_id INTEGER NOT NULL,
    album_id INTEGER NOT NULL,
    PRIMARY KEY (user_id, album_id),
    FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE,
    FOREIGN KEY (album_id) REFERENCES albums (id) ON DELETE CASCADE
);

-- Media Table: one row per indexed file.
CREATE TABLE IF NOT EXISTS media (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    path TEXT NOT NULL,
    path_hash TEXT NOT NULL UNIQUE,
    album_id INTEGER NOT NULL,
    type TEXT NOT NULL, -- 'photo' or 'video'
    date_shot INTEGER NOT NULL, -- Stored as Unix timestamp
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    FOREIGN KEY (album_id) REFERENCES albums (id) ON DELETE CASCADE
);

-- Indexes for tree walks and orphan sweeps
CREATE INDEX IF NOT EXISTS idx_albums_parent ON albums (parent_album_id);
CREATE INDEX IF NOT EXISTS idx_user_albums_album ON user_albums (album_id);
CREATE INDEX IF NOT EXISTS idx_media_album_id ON media (album_id);
"#;
