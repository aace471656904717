//! Removal of catalog entries whose files or directories are gone.

use crate::album_tree;
use crate::config::AppPaths;
use crate::db;
use crate::error::{Error, Result};
use crate::fingerprint::fingerprint;
use crate::models::{Album, Media, User};
use rusqlite::Connection;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Secondary index built from the catalog that must be rebuilt after deletions.
pub trait IndexConsumer: Send + Sync {
    fn reload(&self) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct NoopConsumer;

impl IndexConsumer for NoopConsumer {
    fn reload(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct Reconciler {
    paths: AppPaths,
    consumer: Arc<dyn IndexConsumer>,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("cache_dir", &self.paths.cache_dir)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(paths: AppPaths, consumer: Arc<dyn IndexConsumer>) -> Self {
        Self { paths, consumer }
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    /// Deletes media rows of `album_id` that were not observed on disk, with their caches.
    pub fn cleanup_media(&self, conn: &mut Connection, album_id: i64, observed: &[Media]) -> Vec<Error> {
        let observed: HashSet<&str> = observed.iter().map(|m| m.path_hash.as_str()).collect();

        let stale: Vec<Media> = match db::album_media(conn, album_id) {
            Ok(media) => media
                .into_iter()
                .filter(|m| !observed.contains(m.path_hash.as_str()))
                .collect(),
            Err(err) => return vec![err],
        };
        if stale.is_empty() {
            return Vec::new();
        }

        let mut errors = Vec::new();
        let mut stale_ids = Vec::with_capacity(stale.len());
        for media in &stale {
            log::info!("Removing media no longer on disk: {}", media.path);
            stale_ids.push(media.id);
            if let Err(err) = remove_cache_dir(&self.paths.media_cache(album_id, media.id)) {
                errors.push(err);
            }
        }

        if let Err(err) = db::in_transaction(conn, |tx| db::delete_media(tx, &stale_ids)) {
            log::warn!("Could not delete old media of album {}: {}", album_id, err);
            errors.push(err);
        }
        self.notify_consumer(&mut errors);
        errors
    }

    /// Deletes the user's albums whose directories no longer exist. Albums in `known` were
    /// just visited by a crawl and are not checked again.
    pub fn reconcile(&self, conn: &mut Connection, known: &[Album], user: &User) -> Vec<Error> {
        let all_albums = match album_tree::user_albums(conn, user.id) {
            Ok(albums) => albums,
            Err(err) => return vec![err],
        };
        let seen: HashSet<i64> = known.iter().map(|album| album.id).collect();

        let orphans: Vec<Album> = all_albums
            .into_iter()
            .filter(|album| !seen.contains(&album.id))
            .filter(|album| match std::fs::metadata(&album.path) {
                Ok(_) => false,
                Err(err) => err.kind() == std::io::ErrorKind::NotFound,
            })
            .collect();
        if orphans.is_empty() {
            return Vec::new();
        }

        let mut errors = Vec::new();
        let mut ids = Vec::with_capacity(orphans.len());
        for album in &orphans {
            log::info!("Removing album no longer on disk: {}", album.path);
            ids.push(album.id);
            if let Err(err) = remove_cache_dir(&self.paths.album_cache(album.id)) {
                errors.push(err);
            }
        }

        if let Err(err) = db::in_transaction(conn, |tx| db::delete_albums(tx, &ids)) {
            log::warn!("Could not delete old albums from database: {}", err);
            errors.push(err);
        }
        self.notify_consumer(&mut errors);
        errors
    }

    /// Deletes one media row and its derived cache.
    pub fn remove_media(&self, conn: &mut Connection, media: &Media) -> Result<()> {
        remove_cache_dir(&self.paths.media_cache(media.album_id, media.id))?;
        db::in_transaction(conn, |tx| db::delete_media(tx, &[media.id]))?;
        self.consumer.reload()
    }

    /// Deletes the album at `path`, its sub-albums and their ownership links. Returns the
    /// removed albums, empty when no album is registered at `path`.
    ///
    /// Sub-albums live below `path`, so once the directory is gone they are orphans as well.
    /// Removing only the row would leave them parentless (the foreign key sets the parent to
    /// null) and every later crawl would report them as missing roots.
    pub fn remove_album_at(&self, conn: &mut Connection, path: &Path) -> Result<Vec<Album>> {
        let Some(album) = album_tree::find_album_by_fingerprint(conn, &fingerprint(path)?)? else {
            return Ok(Vec::new());
        };
        let subtree = album_tree::descendants(conn, &[album.id])?;
        let ids: Vec<i64> = subtree.iter().map(|album| album.id).collect();
        for id in &ids {
            remove_cache_dir(&self.paths.album_cache(*id))?;
        }
        db::in_transaction(conn, |tx| db::delete_albums(tx, &ids))?;
        self.consumer.reload()?;
        Ok(subtree)
    }

    fn notify_consumer(&self, errors: &mut Vec<Error>) {
        if let Err(err) = self.consumer.reload() {
            log::warn!("Reloading index consumer failed: {}", err);
            errors.push(err);
        }
    }
}

fn remove_cache_dir(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::io_at(path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::album_tree::{add_root_album, insert_album, NewAlbum};
    use crate::db::{create_user, insert_media, NewMedia};
    use crate::models::MediaType;
    use crate::test_support::TestLibrary;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingConsumer {
        reloads: AtomicUsize,
    }

    impl IndexConsumer for CountingConsumer {
        fn reload(&self) -> Result<()> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingConsumer;

    impl IndexConsumer for FailingConsumer {
        fn reload(&self) -> Result<()> {
            Err(Error::Init("face index offline".into()))
        }
    }

    fn media(conn: &Connection, album_id: i64, path: &str) -> Media {
        insert_media(
            conn,
            NewMedia {
                title: path,
                path,
                path_hash: path,
                album_id,
                media_type: MediaType::Photo,
                date_shot: Utc::now(),
            },
        )
        .unwrap()
    }

    #[test]
    fn unobserved_media_and_caches_are_removed() {
        let lib = TestLibrary::new();
        let mut conn = lib.pool.get().unwrap();
        let user = create_user(&conn, "alice", false).unwrap();
        let album = add_root_album(&conn, user.id, "/p/Family").unwrap();
        let kept = media(&conn, album.id, "kept.jpg");
        let gone = media(&conn, album.id, "gone.jpg");
        let cache = lib.paths.media_cache(album.id, gone.id);
        std::fs::create_dir_all(&cache).unwrap();

        let consumer = Arc::new(CountingConsumer::default());
        let reconciler = Reconciler::new(lib.paths.clone(), consumer.clone());
        let errors = reconciler.cleanup_media(&mut conn, album.id, &[kept.clone()]);

        assert!(errors.is_empty(), "{errors:?}");
        let remaining: Vec<i64> = db::album_media(&conn, album.id)
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(remaining, vec![kept.id]);
        assert!(!cache.exists());
        assert_eq!(consumer.reloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nothing_stale_means_no_reload() {
        let lib = TestLibrary::new();
        let mut conn = lib.pool.get().unwrap();
        let user = create_user(&conn, "alice", false).unwrap();
        let album = add_root_album(&conn, user.id, "/p/Family").unwrap();
        let kept = media(&conn, album.id, "kept.jpg");

        let consumer = Arc::new(CountingConsumer::default());
        let reconciler = Reconciler::new(lib.paths.clone(), consumer.clone());
        assert!(reconciler.cleanup_media(&mut conn, album.id, &[kept]).is_empty());
        assert_eq!(consumer.reloads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn missing_album_directories_are_deleted_with_links() {
        let lib = TestLibrary::new();
        let mut conn = lib.pool.get().unwrap();
        let photos = lib.photos();
        let root_path = photos.join("Family");
        std::fs::create_dir_all(&root_path).unwrap();

        let user = create_user(&conn, "alice", false).unwrap();
        let root = add_root_album(&conn, user.id, &root_path).unwrap();
        let gone_path = root_path.join("2019");
        let gone = insert_album(
            &conn,
            NewAlbum {
                title: "2019",
                parent_album_id: Some(root.id),
                path: &gone_path,
                modify_time: Some(1),
            },
        )
        .unwrap();
        db::add_album_owner(&conn, gone.id, user.id).unwrap();
        media(&conn, gone.id, "old.jpg");
        let cache = lib.paths.media_cache(gone.id, 1);
        std::fs::create_dir_all(&cache).unwrap();

        let reconciler = Reconciler::new(lib.paths.clone(), Arc::new(NoopConsumer));
        let errors = reconciler.reconcile(&mut conn, &[root.clone()], &user);

        assert!(errors.is_empty(), "{errors:?}");
        assert!(album_tree::find_album(&conn, gone.id).unwrap().is_none());
        assert!(db::album_media(&conn, gone.id).unwrap().is_empty());
        assert_eq!(db::album_owners(&conn, gone.id).unwrap(), Vec::<i64>::new());
        assert!(!lib.paths.album_cache(gone.id).exists());
        assert!(album_tree::find_album(&conn, root.id).unwrap().is_some());
    }

    #[test]
    fn consumer_failure_is_reported_not_fatal() {
        let lib = TestLibrary::new();
        let mut conn = lib.pool.get().unwrap();
        let user = create_user(&conn, "alice", false).unwrap();
        let album = add_root_album(&conn, user.id, "/definitely/not/here").unwrap();

        let reconciler = Reconciler::new(lib.paths.clone(), Arc::new(FailingConsumer));
        let errors = reconciler.reconcile(&mut conn, &[], &user);

        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], Error::Init(_)));
        assert!(album_tree::find_album(&conn, album.id).unwrap().is_none());
    }

    #[test]
    fn remove_album_at_unknown_path_is_a_no_op() {
        let lib = TestLibrary::new();
        let mut conn = lib.pool.get().unwrap();
        let reconciler = Reconciler::new(lib.paths.clone(), Arc::new(NoopConsumer));
        assert!(reconciler
            .remove_album_at(&mut conn, Path::new("/nowhere"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn remove_album_at_takes_the_subtree() {
        let lib = TestLibrary::new();
        let mut conn = lib.pool.get().unwrap();
        let user = create_user(&conn, "alice", false).unwrap();
        let root = add_root_album(&conn, user.id, "/p/Family").unwrap();
        let child = insert_album(
            &conn,
            NewAlbum {
                title: "2020",
                parent_album_id: Some(root.id),
                path: Path::new("/p/Family/2020"),
                modify_time: None,
            },
        )
        .unwrap();
        let grandchild = insert_album(
            &conn,
            NewAlbum {
                title: "summer",
                parent_album_id: Some(child.id),
                path: Path::new("/p/Family/2020/summer"),
                modify_time: None,
            },
        )
        .unwrap();
        std::fs::create_dir_all(lib.paths.album_cache(grandchild.id)).unwrap();

        let reconciler = Reconciler::new(lib.paths.clone(), Arc::new(NoopConsumer));
        let removed = reconciler
            .remove_album_at(&mut conn, Path::new("/p/Family/2020"))
            .unwrap();

        let mut ids: Vec<i64> = removed.iter().map(|album| album.id).collect();
        ids.sort();
        assert_eq!(ids, vec![child.id, grandchild.id]);
        assert!(album_tree::find_album(&conn, root.id).unwrap().is_some());
        assert!(album_tree::find_album(&conn, grandchild.id).unwrap().is_none());
        assert!(!lib.paths.album_cache(grandchild.id).exists());
        let parentless: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM albums WHERE parent_album_id IS NULL",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(parentless, 1);
    }
}
