use crate::album_tree::{self, NewAlbum};
use crate::cleanup::Reconciler;
use crate::config::ScannerConfig;
use crate::db::{self, DbPool, NewMedia};
use crate::error::{Error, Result};
use crate::fingerprint::media_fingerprint;
use crate::ignore_rules::{self, IgnoreRules};
use crate::models::{Album, Media, ScanReport, User};
use crate::scan_cache::{is_dir_like, is_hidden, ScanCache};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Downstream pipeline (thumbnails, metadata, ...) handed every newly indexed media.
pub trait MediaProcessor: Send + Sync {
    fn process(&self, media: &Media, album: &Album) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct LoggingProcessor;

impl MediaProcessor for LoggingProcessor {
    fn process(&self, media: &Media, album: &Album) -> Result<()> {
        log::info!("Media {} in album {} ready for processing", media.path, album.title);
        Ok(())
    }
}

/// Collaborators shared by every scan.
#[derive(Clone)]
pub struct ScanContext {
    pub config: ScannerConfig,
    pub reconciler: Reconciler,
    pub processor: Arc<dyn MediaProcessor>,
}

impl fmt::Debug for ScanContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanContext")
            .field("config", &self.config)
            .field("reconciler", &self.reconciler)
            .finish_non_exhaustive()
    }
}

impl ScanContext {
    pub fn new_cache(&self) -> ScanCache {
        ScanCache::new(self.config.ignore_file_name.clone())
    }
}

struct ScanInfo {
    path: PathBuf,
    parent: Option<Album>,
    ignore: IgnoreRules,
    modify_time: i64,
}

/// Unix seconds of the entry's modify time, 0 when the platform cannot tell.
pub(crate) fn modify_time(metadata: &fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Crawls the user's root albums breadth first, creating and refreshing album rows, then
/// removes albums whose directories are gone. Returns the albums whose contents changed.
pub fn find_albums_for_user(
    conn: &mut Connection,
    ctx: &ScanContext,
    user: &User,
    cache: &mut ScanCache,
    force_full: bool,
) -> ScanReport {
    let mut report = ScanReport::default();

    let user_albums = match album_tree::user_albums(conn, user.id) {
        Ok(albums) => albums,
        Err(err) => {
            report.errors.push(err);
            return report;
        }
    };
    let forest = album_tree::AlbumForest::new(user_albums);

    let mut queue = VecDeque::new();
    for root in forest.roots() {
        match fs::metadata(&root.path) {
            Ok(metadata) => queue.push_back(ScanInfo {
                path: PathBuf::from(&root.path),
                parent: None,
                ignore: IgnoreRules::default(),
                modify_time: modify_time(&metadata),
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                report.errors.push(Error::MissingRoot {
                    user: user.username.clone(),
                    path: PathBuf::from(&root.path),
                });
            }
            Err(err) => report.errors.push(Error::io_at(&root.path, err)),
        }
    }

    let mut known_albums = Vec::new();

    while let Some(info) = queue.pop_front() {
        let mut entries = match read_entries(&info.path) {
            Ok(entries) => entries,
            Err(err) => {
                report.errors.push(err);
                continue;
            }
        };
        entries.sort_by(|a, b| b.1.cmp(&a.1));

        if info.ignore.is_ignored(&info.path, true) {
            log::info!("Skip, directory {} is in ignore file", info.path.display());
            continue;
        }

        let ignore = cache.resolve_ignore_rules(&info.path, &info.ignore);

        let outcome = db::in_transaction(conn, |tx| {
            reconcile_directory(tx, &info, user, &ignore, cache, force_full)
        });
        let album = match outcome {
            Ok((album, skip)) => {
                known_albums.push(album.clone());
                if !skip {
                    report.needs_processing.push(album.clone());
                }
                album
            }
            Err(err) => {
                log::warn!("Could not reconcile {}: {}", info.path.display(), err);
                report.errors.push(err);
                continue;
            }
        };

        for (entry, entry_mtime) in entries {
            let sub_path = entry.path();
            if is_hidden(&sub_path) {
                continue;
            }
            let is_dir = match is_dir_like(&entry) {
                Ok(is_dir) => is_dir,
                Err(err) => {
                    report.errors.push(Error::io_at(&sub_path, err));
                    continue;
                }
            };
            if !is_dir {
                continue;
            }
            match cache.contains_media(&sub_path, &ignore) {
                Ok(true) => queue.push_back(ScanInfo {
                    path: sub_path,
                    parent: Some(album.clone()),
                    ignore: ignore.clone(),
                    modify_time: entry_mtime,
                }),
                Ok(false) => log::debug!("No media below {}", sub_path.display()),
                Err(err) => report.errors.push(err),
            }
        }
    }

    let cleanup_errors = ctx.reconciler.reconcile(conn, &known_albums, user);
    report.errors.extend(cleanup_errors);
    log::info!(
        "Scan of {} visited {} albums, {} need processing",
        user.username,
        known_albums.len(),
        report.needs_processing.len()
    );
    report
}

fn read_entries(dir: &Path) -> Result<Vec<(fs::DirEntry, i64)>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(|err| Error::io_at(dir, err))? {
        let entry = entry.map_err(|err| Error::io_at(dir, err))?;
        let mtime = entry.metadata().map(|m| modify_time(&m)).unwrap_or(0);
        entries.push((entry, mtime));
    }
    Ok(entries)
}

/// Creates or refreshes the album for one directory. The flag is true when the album is
/// unchanged since the last scan.
fn reconcile_directory(
    tx: &Connection,
    info: &ScanInfo,
    user: &User,
    ignore: &IgnoreRules,
    cache: &mut ScanCache,
    force_full: bool,
) -> Result<(Album, bool)> {
    log::debug!("Scanning directory: {}", info.path.display());

    let Some(mut album) = album_tree::find_album_by_path(tx, &info.path)? else {
        let owners = match &info.parent {
            Some(parent) => db::album_owners(tx, parent.id)?,
            None => vec![user.id],
        };
        let title = album_tree::base_name(&info.path);
        let album = album_tree::insert_album(
            tx,
            NewAlbum {
                title: &title,
                parent_album_id: info.parent.as_ref().map(|p| p.id),
                path: &info.path,
                modify_time: Some(info.modify_time),
            },
        )?;
        for owner in owners {
            db::add_album_owner(tx, album.id, owner)?;
        }
        cache.insert_ignore_rules(&info.path, ignore.clone());
        return Ok((album, false));
    };

    let skip = !force_full && album.last_modify_time == Some(info.modify_time);
    if skip {
        log::debug!("Skip directory: {}", info.path.display());
    } else {
        album_tree::set_album_watermark(tx, album.id, info.modify_time)?;
        album.last_last_modify_time = album.last_modify_time;
        album.last_modify_time = Some(info.modify_time);
    }

    if !db::is_album_owner(tx, album.id, user.id)? {
        db::add_album_owner(tx, album.id, user.id)?;
    }
    cache.insert_ignore_rules(&info.path, ignore.clone());
    Ok((album, skip))
}

/// Creates the media row for `path`, or refreshes title and path of the row that already
/// carries its fingerprint. The flag is true when a row was created.
pub fn scan_one_media(
    conn: &Connection,
    path: &Path,
    album_id: i64,
    cache: &mut ScanCache,
    retouch_marker: &str,
) -> Result<(Media, bool)> {
    let title = album_tree::base_name(path);
    let path_str = path.to_string_lossy().to_string();
    let path_hash = media_fingerprint(path, retouch_marker)?;

    if let Some(mut media) = db::find_media_by_fingerprint(conn, &path_hash)? {
        if media.title != title || media.path != path_str {
            db::update_media_location(conn, media.id, &title, &path_str)?;
            media.title = title;
            media.path = path_str;
        }
        return Ok((media, false));
    }

    log::info!("Scanning media: {}", path.display());

    let media_type = cache
        .media_type(path)?
        .ok_or_else(|| Error::NotMedia(path.to_path_buf()))?;
    let metadata = fs::metadata(path).map_err(|err| Error::io_at(path, err))?;
    let date_shot = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    let media = db::insert_media(
        conn,
        NewMedia {
            title: &title,
            path: &path_str,
            path_hash: &path_hash,
            album_id,
            media_type,
            date_shot,
        },
    )?;
    Ok((media, true))
}

/// Rules in effect for an album directory, from the scan cache or rebuilt from its root.
pub fn rules_for_album(conn: &Connection, album: &Album, cache: &mut ScanCache) -> Result<IgnoreRules> {
    if let Some(rules) = cache.ignore_rules(album.file_path()) {
        return Ok(rules.clone());
    }
    let chain = album_tree::ancestors(conn, album.id)?;
    let root = chain
        .last()
        .map(|root| PathBuf::from(&root.path))
        .unwrap_or_else(|| PathBuf::from(&album.path));
    let rules = ignore_rules::resolve_chain(&root, album.file_path(), cache.ignore_file_name());
    cache.insert_ignore_rules(album.file_path(), rules.clone());
    Ok(rules)
}

/// Indexes the media files directly inside an album and drops rows for files that are gone.
/// Each entry is flagged true when its row was created by this call.
pub fn find_media_for_album(
    conn: &mut Connection,
    ctx: &ScanContext,
    album: &Album,
    cache: &mut ScanCache,
) -> (Vec<(Media, bool)>, Vec<Error>) {
    let mut found = Vec::new();
    let mut errors = Vec::new();

    let rules = match rules_for_album(conn, album, cache) {
        Ok(rules) => rules,
        Err(err) => return (found, vec![err]),
    };
    let entries = match read_entries(album.file_path()) {
        Ok(entries) => entries,
        Err(err) => return (found, vec![err]),
    };

    for (entry, _) in entries {
        let path = entry.path();
        if is_hidden(&path) {
            continue;
        }
        match fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => {}
            Ok(_) => continue,
            Err(err) => {
                errors.push(Error::io_at(&path, err));
                continue;
            }
        }
        if rules.is_ignored(&path, false) {
            log::debug!("Ignoring {}", path.display());
            continue;
        }
        match cache.media_type(&path) {
            Ok(Some(_)) => {}
            Ok(None) => continue,
            Err(err) => {
                errors.push(err);
                continue;
            }
        }

        let marker = ctx.config.retouch_marker.as_str();
        match db::in_transaction(conn, |tx| scan_one_media(tx, &path, album.id, cache, marker)) {
            Ok(scanned) => found.push(scanned),
            Err(err) => errors.push(err),
        }
    }

    let observed: Vec<Media> = found.iter().map(|(media, _)| media.clone()).collect();
    errors.extend(ctx.reconciler.cleanup_media(conn, album.id, &observed));
    (found, errors)
}

/// Full scan pass for one user: crawl, then index media of every changed album.
pub fn scan_user(pool: &DbPool, ctx: &ScanContext, user: &User, force_full: bool) -> Result<ScanReport> {
    let mut conn = pool.get()?;
    let mut cache = ctx.new_cache();

    let mut report = find_albums_for_user(&mut conn, ctx, user, &mut cache, force_full);
    for album in &report.needs_processing {
        let (media, errors) = find_media_for_album(&mut conn, ctx, album, &mut cache);
        report.errors.extend(errors);
        for (media, created) in media {
            if !created {
                continue;
            }
            if let Err(err) = ctx.processor.process(&media, album) {
                log::warn!("Processing {} failed: {}", media.path, err);
                report.errors.push(err);
            }
        }
    }
    Ok(report)
}

/// Hands an existing media to the processor again, e.g. after its cache was corrupted.
pub fn process_single_media(
    conn: &Connection,
    ctx: &ScanContext,
    media: &Media,
    album: Option<&Album>,
) -> Result<()> {
    let album = match album {
        Some(album) => album.clone(),
        None => album_tree::find_album(conn, media.album_id)?
            .ok_or_else(|| Error::Path(format!("album {} of {} not found", media.album_id, media.path)))?,
    };
    ctx.processor.process(media, &album)
}
