//! Incremental indexing from filesystem notifications.
//!
//! Events from `notify` are flattened into [`Signal`]s, routed to one of four actions
//! (file finalized, directory created, file removed, directory removed) and applied to
//! the catalog one path at a time.

use crate::album_tree::{self, NewAlbum};
use crate::config::DatabaseDriver;
use crate::db::{self, DbPool};
use crate::error::{Error, Result};
use crate::fingerprint::{fingerprint, media_fingerprint, toggle_marker};
use crate::ignore_rules::IgnoreRules;
use crate::models::Album;
use crate::scan::{self, modify_time, ScanContext};
use crate::scan_cache::{is_dir_like, is_hidden, ScanCache};
use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver};
use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use rusqlite::Connection;
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    CloseWrite,
    Create,
    Delete,
    MovedIn,
    MovedOut,
}

/// One low-level notification for one path. `dir_hint` is set when the backend reported
/// whether the path is a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub kind: SignalKind,
    pub path: PathBuf,
    pub dir_hint: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    FileFinalized(PathBuf),
    DirCreated(PathBuf),
    FileRemoved(PathBuf),
    DirRemoved(PathBuf),
}

/// Splits a notify event into per-path signals, dropping paths with the temporary suffix.
pub fn classify(event: &Event, temp_suffix: &str) -> Vec<Signal> {
    let (kind, dir_hint) = match event.kind {
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => (SignalKind::CloseWrite, Some(false)),
        EventKind::Create(CreateKind::Folder) => (SignalKind::Create, Some(true)),
        EventKind::Create(CreateKind::File) => (SignalKind::Create, Some(false)),
        EventKind::Create(_) => (SignalKind::Create, None),
        EventKind::Remove(RemoveKind::Folder) => (SignalKind::Delete, Some(true)),
        EventKind::Remove(RemoveKind::File) => (SignalKind::Delete, Some(false)),
        EventKind::Remove(_) => (SignalKind::Delete, None),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => (SignalKind::MovedIn, None),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => (SignalKind::MovedOut, None),
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => {
            // Backends without rename pairing report both halves alike.
            return event
                .paths
                .iter()
                .filter(|path| !is_temporary(path, temp_suffix))
                .map(|path| Signal {
                    kind: if path.exists() {
                        SignalKind::MovedIn
                    } else {
                        SignalKind::MovedOut
                    },
                    path: path.clone(),
                    dir_hint: None,
                })
                .collect();
        }
        // Content and metadata changes; paired renames also arrive as separate From and To.
        _ => return Vec::new(),
    };

    event
        .paths
        .iter()
        .filter(|path| !is_temporary(path, temp_suffix))
        .map(|path| Signal {
            kind,
            path: path.clone(),
            dir_hint,
        })
        .collect()
}

fn is_temporary(path: &Path, temp_suffix: &str) -> bool {
    !temp_suffix.is_empty() && path.to_string_lossy().ends_with(temp_suffix)
}

/// The set of watched directories, mirrored into the OS subscription once one is attached.
#[derive(Default)]
pub struct WatchRegistry {
    watcher: Mutex<Option<RecommendedWatcher>>,
    watched: Mutex<HashSet<PathBuf>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WatchRegistry {
    fn attach(&self, mut watcher: RecommendedWatcher) -> Result<()> {
        for path in lock(&self.watched).iter() {
            watcher.watch(path, RecursiveMode::NonRecursive)?;
        }
        *lock(&self.watcher) = Some(watcher);
        Ok(())
    }

    fn detach(&self) -> Option<RecommendedWatcher> {
        lock(&self.watcher).take()
    }

    pub fn add(&self, path: &Path) -> Result<()> {
        if !lock(&self.watched).insert(path.to_path_buf()) {
            return Ok(());
        }
        if let Some(watcher) = lock(&self.watcher).as_mut() {
            watcher.watch(path, RecursiveMode::NonRecursive)?;
        }
        log::debug!("Watching {}", path.display());
        Ok(())
    }

    pub fn remove(&self, path: &Path) {
        if !lock(&self.watched).remove(path) {
            return;
        }
        if let Some(watcher) = lock(&self.watcher).as_mut() {
            // The OS drops watches of deleted directories on its own.
            if let Err(err) = watcher.unwatch(path) {
                log::debug!("Unwatch {}: {}", path.display(), err);
            }
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        lock(&self.watched).contains(path)
    }

    pub fn len(&self) -> usize {
        lock(&self.watched).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Applies routed actions to the catalog.
pub struct EventHandler {
    pool: DbPool,
    ctx: ScanContext,
    owners: Vec<i64>,
    registry: Arc<WatchRegistry>,
}

impl EventHandler {
    pub fn new(pool: DbPool, ctx: ScanContext, owners: Vec<i64>, registry: Arc<WatchRegistry>) -> Self {
        Self {
            pool,
            ctx,
            owners,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<WatchRegistry> {
        &self.registry
    }

    /// Classifies and applies one event. Each path is handled on its own; the first
    /// failure is returned after the remaining paths were tried.
    pub fn dispatch(&self, event: &Event) -> Result<()> {
        let mut first_error = None;
        for signal in classify(event, &self.ctx.config.temp_suffix) {
            if let Err(err) = self.dispatch_signal(signal) {
                log::warn!("Watch event failed: {}", err);
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn dispatch_signal(&self, signal: Signal) -> Result<()> {
        let action = {
            let conn = self.pool.get()?;
            route(&conn, signal)?
        };
        match action {
            Some(action) => self.apply(action),
            None => Ok(()),
        }
    }

    pub fn apply(&self, action: Action) -> Result<()> {
        match action {
            Action::FileFinalized(path) => self.handle_file_finalized(&path),
            Action::DirCreated(path) => self.handle_dir_created(&path),
            Action::FileRemoved(path) => self.handle_file_removed(&path),
            Action::DirRemoved(path) => self.handle_dir_removed(&path),
        }
    }

    pub fn handle_file_finalized(&self, path: &Path) -> Result<()> {
        log::info!("Create file {}", path.display());
        if is_hidden(path) {
            return Ok(());
        }
        let marker = self.ctx.config.retouch_marker.as_str();

        let counterpart = toggle_marker(path, marker);
        match fs::remove_file(&counterpart) {
            Ok(()) => log::info!("Removed superseded file {}", counterpart.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => log::warn!("Could not remove {}: {}", counterpart.display(), err),
        }
        if !path.exists() {
            log::debug!("{} is gone, nothing to index", path.display());
            return Ok(());
        }

        let mut conn = self.pool.get()?;
        let Some(mut album) = parent_album(&conn, path)? else {
            log::debug!("No album for {}", path.display());
            return Ok(());
        };

        let mut cache = self.ctx.new_cache();
        let rules = scan::rules_for_album(&conn, &album, &mut cache)?;
        if rules.is_ignored(path, false) {
            log::debug!("Ignoring {}", path.display());
            return Ok(());
        }

        let now = Utc::now().timestamp();
        album_tree::set_album_watermark(&conn, album.id, now)?;
        album.last_last_modify_time = album.last_modify_time;
        album.last_modify_time = Some(now);

        let mut attempt = || {
            db::in_transaction(&mut conn, |tx| {
                scan::scan_one_media(tx, path, album.id, &mut cache, marker)
            })
        };
        let scanned = match attempt() {
            Err(Error::NotMedia(_)) => {
                log::debug!("{} is not a media file", path.display());
                return Ok(());
            }
            Err(err) => {
                log::warn!("Indexing {} failed, retrying: {}", path.display(), err);
                attempt()?
            }
            Ok(scanned) => scanned,
        };

        let (media, created) = scanned;
        if created {
            self.ctx.processor.process(&media, &album)?;
        }
        Ok(())
    }

    /// Watches `path` and, when its parent is an album, adopts it and everything already
    /// inside it. Subdirectories are walked breadth first on one connection; a failing
    /// directory loses its own subtree only.
    pub fn handle_dir_created(&self, path: &Path) -> Result<()> {
        log::info!("Create dir {}", path.display());
        if is_hidden(path) {
            return Ok(());
        }
        self.registry.add(path)?;

        let mut conn = self.pool.get()?;
        let Some(parent) = parent_album(&conn, path)? else {
            log::debug!("No parent album for {}", path.display());
            return Ok(());
        };
        let mut cache = self.ctx.new_cache();
        let inherited = scan::rules_for_album(&conn, &parent, &mut cache)?;

        let mut queue = VecDeque::from([(path.to_path_buf(), parent, inherited)]);
        let mut first_error = None;
        while let Some((dir, parent, inherited)) = queue.pop_front() {
            let adopted = match self.adopt_directory(&mut conn, &dir, &parent, &inherited, &mut cache) {
                Ok(Some(adopted)) => adopted,
                Ok(None) => continue,
                Err(err) => {
                    log::warn!("Could not adopt {}: {}", dir.display(), err);
                    first_error.get_or_insert(err);
                    continue;
                }
            };
            match subdirectories(&dir) {
                Ok(subdirs) => {
                    for sub in subdirs {
                        queue.push_back((sub, adopted.0.clone(), adopted.1.clone()));
                    }
                }
                Err(err) => {
                    log::warn!("Could not list {}: {}", dir.display(), err);
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Creates the album for one new directory and indexes the media already in it.
    /// Returns `None` for ignored, vanished or already catalogued directories.
    fn adopt_directory(
        &self,
        conn: &mut Connection,
        dir: &Path,
        parent: &Album,
        inherited: &IgnoreRules,
        cache: &mut ScanCache,
    ) -> Result<Option<(Album, IgnoreRules)>> {
        self.registry.add(dir)?;
        if inherited.is_ignored(dir, true) {
            log::debug!("Ignoring {}", dir.display());
            return Ok(None);
        }
        if album_tree::find_album_by_path(conn, dir)?.is_some() {
            return Ok(None);
        }
        let metadata = match fs::metadata(dir) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::io_at(dir, err)),
        };

        let title = album_tree::base_name(dir);
        let album = db::in_transaction(conn, |tx| {
            let album = album_tree::insert_album(
                tx,
                NewAlbum {
                    title: &title,
                    parent_album_id: Some(parent.id),
                    path: dir,
                    modify_time: Some(modify_time(&metadata)),
                },
            )?;
            for owner in &self.owners {
                db::add_album_owner(tx, album.id, *owner)?;
            }
            Ok(album)
        })?;
        let rules = cache.resolve_ignore_rules(dir, inherited);

        // A directory moved in may arrive with content already inside.
        let (found, errors) = scan::find_media_for_album(conn, &self.ctx, &album, cache);
        for err in errors {
            log::warn!("Indexing {} failed: {}", album.path, err);
        }
        for (media, created) in found {
            if !created {
                continue;
            }
            if let Err(err) = self.ctx.processor.process(&media, &album) {
                log::warn!("Processing {} failed: {}", media.path, err);
            }
        }
        Ok(Some((album, rules)))
    }

    pub fn handle_file_removed(&self, path: &Path) -> Result<()> {
        log::info!("Delete file {}", path.display());
        let mut conn = self.pool.get()?;
        let path_hash = media_fingerprint(path, &self.ctx.config.retouch_marker)?;
        let Some(media) = db::find_media_by_fingerprint(&conn, &path_hash)? else {
            return Ok(());
        };
        if media.file_path() != path && media.file_path().exists() {
            log::debug!("{} now belongs to {}", path.display(), media.path);
            return Ok(());
        }
        self.ctx.reconciler.remove_media(&mut conn, &media)
    }

    pub fn handle_dir_removed(&self, path: &Path) -> Result<()> {
        log::info!("Delete dir {}", path.display());
        self.registry.remove(path);
        let mut conn = self.pool.get()?;
        for album in self.ctx.reconciler.remove_album_at(&mut conn, path)? {
            self.registry.remove(album.file_path());
        }
        Ok(())
    }
}

fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut subdirs = Vec::new();
    for entry in fs::read_dir(dir).map_err(|err| Error::io_at(dir, err))? {
        let entry = entry.map_err(|err| Error::io_at(dir, err))?;
        let path = entry.path();
        if !is_hidden(&path) && is_dir_like(&entry).unwrap_or(false) {
            subdirs.push(path);
        }
    }
    Ok(subdirs)
}

fn parent_album(conn: &Connection, path: &Path) -> Result<Option<Album>> {
    match path.parent() {
        Some(parent) => album_tree::find_album_by_fingerprint(conn, &fingerprint(parent)?),
        None => Ok(None),
    }
}

/// Decides which action a signal stands for. Directory-ness of new paths comes from
/// `stat`, of vanished paths from the catalog.
pub fn route(conn: &Connection, signal: Signal) -> Result<Option<Action>> {
    let Signal {
        kind,
        path,
        dir_hint,
    } = signal;

    let action = match kind {
        SignalKind::CloseWrite => Some(Action::FileFinalized(path)),
        SignalKind::Create | SignalKind::MovedIn => {
            let is_dir = match dir_hint {
                Some(is_dir) => is_dir,
                None => match fs::metadata(&path) {
                    Ok(metadata) => metadata.is_dir(),
                    Err(_) => return Ok(None),
                },
            };
            match (is_dir, kind) {
                (true, _) => Some(Action::DirCreated(path)),
                (false, SignalKind::MovedIn) => Some(Action::FileFinalized(path)),
                // Files are indexed once their writer closes them.
                (false, _) => None,
            }
        }
        SignalKind::Delete | SignalKind::MovedOut => {
            let is_dir = match dir_hint {
                Some(is_dir) => is_dir,
                None => album_tree::find_album_by_fingerprint(conn, &fingerprint(&path)?)?.is_some(),
            };
            if is_dir {
                Some(Action::DirRemoved(path))
            } else {
                Some(Action::FileRemoved(path))
            }
        }
    };
    Ok(action)
}

fn run_worker(events: Receiver<notify::Result<Event>>, handler: Arc<EventHandler>) {
    for event in events.iter() {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                log::warn!("Watcher error: {}", err);
                continue;
            }
        };
        match catch_unwind(AssertUnwindSafe(|| handler.dispatch(&event))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::debug!("Event {:?} finished with error: {}", event.kind, err),
            Err(_) => log::error!("Handler panicked on {:?}", event.paths),
        }
    }
}

/// Running watcher: the OS subscription plus the worker threads draining it.
pub struct FsWatcher {
    registry: Arc<WatchRegistry>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl FsWatcher {
    /// Watches every directory below the root albums of `owners`. New albums are granted
    /// to the same owners.
    pub fn start(pool: DbPool, ctx: ScanContext, driver: DatabaseDriver, owners: Vec<i64>) -> Result<Self> {
        let worker_count = ctx.config.effective_workers(driver)?;
        let roots = root_paths(&pool, &owners)?;

        let registry = Arc::new(WatchRegistry::default());
        for root in &roots {
            for entry in WalkDir::new(root)
                .follow_links(true)
                .into_iter()
                .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.path()))
            {
                match entry {
                    Ok(entry) if entry.file_type().is_dir() => registry.add(entry.path())?,
                    Ok(_) => {}
                    Err(err) => log::warn!("Walking {}: {}", root.display(), err),
                }
            }
        }

        let (tx, rx) = unbounded();
        let watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            let _ = tx.send(event);
        })?;
        registry.attach(watcher)?;
        log::info!("Watching {} directories with {} workers", registry.len(), worker_count);

        let handler = Arc::new(EventHandler::new(pool, ctx, owners, registry.clone()));
        let workers = (0..worker_count)
            .map(|_| {
                let rx = rx.clone();
                let handler = handler.clone();
                thread::spawn(move || run_worker(rx, handler))
            })
            .collect();

        Ok(Self { registry, workers })
    }

    pub fn registry(&self) -> &WatchRegistry {
        &self.registry
    }

    /// Drops the OS subscription, which ends the event stream, then waits for the workers.
    pub fn stop(mut self) {
        drop(self.registry.detach());
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("Watch worker exited by panic");
            }
        }
    }
}

fn root_paths(pool: &DbPool, owners: &[i64]) -> Result<Vec<PathBuf>> {
    let conn = pool.get()?;
    let mut roots = Vec::new();
    for owner in owners {
        let forest = album_tree::AlbumForest::new(album_tree::user_albums(&conn, *owner)?);
        for root in forest.roots() {
            let path = PathBuf::from(&root.path);
            if !roots.contains(&path) {
                roots.push(path);
            }
        }
    }
    Ok(roots)
}
