//! Scan-scoped memoization of ignore rules, media classification and media presence.

use crate::error::{Error, Result};
use crate::ignore_rules::{self, IgnoreRules};
use crate::media_type;
use crate::models::MediaType;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct ScanCache {
    ignore_file_name: String,
    ignore_rules: HashMap<PathBuf, IgnoreRules>,
    contains_media: HashMap<PathBuf, bool>,
    media_types: HashMap<PathBuf, Option<MediaType>>,
}

impl ScanCache {
    pub fn new(ignore_file_name: impl Into<String>) -> Self {
        Self {
            ignore_file_name: ignore_file_name.into(),
            ignore_rules: HashMap::new(),
            contains_media: HashMap::new(),
            media_types: HashMap::new(),
        }
    }

    pub fn ignore_file_name(&self) -> &str {
        &self.ignore_file_name
    }

    pub fn insert_ignore_rules(&mut self, path: &Path, rules: IgnoreRules) {
        self.ignore_rules.insert(path.to_path_buf(), rules);
    }

    pub fn ignore_rules(&self, path: &Path) -> Option<&IgnoreRules> {
        self.ignore_rules.get(path)
    }

    /// Cached rules for `dir`, or `inherited` extended with the directory's ignore file.
    pub fn resolve_ignore_rules(&mut self, dir: &Path, inherited: &IgnoreRules) -> IgnoreRules {
        if let Some(rules) = self.ignore_rules.get(dir) {
            return rules.clone();
        }
        let rules = ignore_rules::resolve_lenient(inherited, dir, &self.ignore_file_name);
        self.ignore_rules.insert(dir.to_path_buf(), rules.clone());
        rules
    }

    pub fn cached_contains_media(&self, path: &Path) -> Option<bool> {
        self.contains_media.get(path).copied()
    }

    /// Media classification of a file, sniffed once per scan.
    pub fn media_type(&mut self, path: &Path) -> Result<Option<MediaType>> {
        if let Some(kind) = self.media_types.get(path) {
            return Ok(*kind);
        }
        let kind = media_type::sniff(path)?;
        self.media_types.insert(path.to_path_buf(), kind);
        Ok(kind)
    }

    /// Whether the subtree at `root` holds at least one non-ignored media file.
    pub fn contains_media(&mut self, root: &Path, inherited: &IgnoreRules) -> Result<bool> {
        if let Some(found) = self.cached_contains_media(root) {
            return Ok(found);
        }

        let mut queue = VecDeque::new();
        queue.push_back((root.to_path_buf(), inherited.clone()));
        let mut visited = Vec::new();

        while let Some((dir, parent_rules)) = queue.pop_front() {
            visited.push(dir.clone());
            let rules = self.resolve_ignore_rules(&dir, &parent_rules);

            let entries = fs::read_dir(&dir).map_err(|err| Error::io_at(&dir, err))?;
            for entry in entries {
                let entry = entry.map_err(|err| Error::io_at(&dir, err))?;
                let path = entry.path();
                if is_hidden(&path) {
                    continue;
                }
                let is_dir = match is_dir_like(&entry) {
                    Ok(is_dir) => is_dir,
                    Err(err) => {
                        log::debug!(
                            "Cannot resolve {}, pretending it is a file: {}",
                            path.display(),
                            err
                        );
                        false
                    }
                };

                if is_dir {
                    match self.cached_contains_media(&path) {
                        Some(true) if !rules.is_ignored(&path, true) => {
                            self.mark_found(root, &dir);
                            return Ok(true);
                        }
                        Some(_) => {}
                        None => queue.push_back((path, rules.clone())),
                    }
                    continue;
                }

                let kind = match self.media_type(&path) {
                    Ok(kind) => kind,
                    Err(err) => {
                        log::warn!("Could not classify {}: {}", path.display(), err);
                        None
                    }
                };
                if kind.is_none() {
                    continue;
                }
                if rules.is_ignored(&path, false) {
                    log::debug!("Match found {}, continue search for media", path.display());
                    continue;
                }
                log::debug!("{} contains media under {}", root.display(), dir.display());
                self.mark_found(root, &dir);
                return Ok(true);
            }
        }

        for dir in visited {
            self.contains_media.insert(dir, false);
        }
        Ok(false)
    }

    /// Records `found` and each of its ancestors up to `root` as containing media.
    fn mark_found(&mut self, root: &Path, found: &Path) {
        for dir in found.ancestors() {
            self.contains_media.insert(dir.to_path_buf(), true);
            if dir == root || !dir.starts_with(root) {
                break;
            }
        }
    }
}

pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

/// Directory, or symbolic link resolving to a directory.
pub fn is_dir_like(entry: &fs::DirEntry) -> std::io::Result<bool> {
    let file_type = entry.file_type()?;
    if file_type.is_dir() {
        return Ok(true);
    }
    if file_type.is_symlink() {
        return Ok(fs::metadata(entry.path())?.is_dir());
    }
    Ok(false)
}
