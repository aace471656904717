//! Fixtures shared by the unit tests.

use crate::config::{AppPaths, Settings};
use crate::db::{self, DbPool};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::functions::FunctionFlags;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

const JPEG_HEADER: &[u8] = &[
    0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46, 0x00, 0x01,
];

pub struct TestLibrary {
    pub dir: TempDir,
    pub pool: DbPool,
    pub paths: AppPaths,
    pub settings: Settings,
}

impl TestLibrary {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::discover(&dir.path().join("data")).unwrap();
        let pool = db::init_database(&paths.db_path).unwrap();
        Self {
            dir,
            pool,
            paths,
            settings: Settings::default(),
        }
    }

    /// Directory for photo trees, outside the data directory.
    pub fn photos(&self) -> PathBuf {
        let photos = self.dir.path().join("photos");
        fs::create_dir_all(&photos).unwrap();
        photos
    }

    /// A second pool on the same database where the next `failures` media inserts abort.
    /// The countdown is shared by every connection of the returned pool.
    pub fn pool_failing_media_inserts(&self, failures: usize) -> DbPool {
        let remaining = Arc::new(AtomicUsize::new(failures));
        let manager = SqliteConnectionManager::file(&self.paths.db_path).with_init(move |conn| {
            let remaining = remaining.clone();
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.create_scalar_function("fail_once", 0, FunctionFlags::SQLITE_UTF8, move |_| {
                Ok(remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok())
            })
        });
        let pool = r2d2::Pool::new(manager).unwrap();
        pool.get()
            .unwrap()
            .execute_batch(
                "DROP TRIGGER IF EXISTS media_fail_once;
                 CREATE TRIGGER media_fail_once BEFORE INSERT ON media WHEN fail_once()
                 BEGIN SELECT RAISE(ABORT, 'disk hiccup'); END;",
            )
            .unwrap();
        pool
    }
}

pub fn write_jpeg(path: &Path) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, JPEG_HEADER).unwrap();
}

pub fn write_text(path: &Path) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, b"plain text, not a photo").unwrap();
}
