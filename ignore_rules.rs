//! Gitignore-style exclusion rules inherited down the directory tree.

use crate::error::{Error, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::Path;
use std::sync::Arc;

/// Ordered rule layers, root-most first. Each layer holds the patterns of one ignore file
/// and is anchored at the directory that declared it.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    layers: Vec<Arc<Gitignore>>,
}

impl IgnoreRules {
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn pattern_count(&self) -> usize {
        self.layers.iter().map(|layer| layer.num_ignores() as usize).sum()
    }

    /// Appends the patterns declared in `dir`. An empty pattern list returns the rules unchanged.
    pub fn extend(&self, dir: &Path, lines: &[String]) -> Result<Self> {
        if lines.is_empty() {
            return Ok(self.clone());
        }
        let mut builder = GitignoreBuilder::new(dir);
        for line in lines {
            builder.add_line(None, line)?;
        }
        let layer = builder.build()?;
        let mut layers = self.layers.clone();
        layers.push(Arc::new(layer));
        Ok(Self { layers })
    }

    /// True when any layer excludes `path` or one of its parents.
    pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        self.layers.iter().any(|layer| {
            let root = layer.path();
            path != root
                && path.starts_with(root)
                && layer.matched_path_or_any_parents(path, is_dir).is_ignore()
        })
    }
}

/// Reads the ignore file in `dir`. A missing file yields no entries.
pub fn read_local_ignore(dir: &Path, file_name: &str) -> Result<Vec<String>> {
    let path = dir.join(file_name);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(Error::io_at(path, err)),
    };
    let lines: Vec<String> = raw.lines().map(|line| line.to_string()).collect();
    for line in &lines {
        log::debug!("Ignore found in {}: {}", dir.display(), line);
    }
    Ok(lines)
}

/// Effective rules for `dir`: `inherited` plus the directory's own ignore file.
pub fn resolve(inherited: &IgnoreRules, dir: &Path, file_name: &str) -> Result<IgnoreRules> {
    let local = read_local_ignore(dir, file_name)?;
    inherited.extend(dir, &local)
}

/// Like [`resolve`], but an unreadable ignore file is logged and treated as empty.
pub fn resolve_lenient(inherited: &IgnoreRules, dir: &Path, file_name: &str) -> IgnoreRules {
    match resolve(inherited, dir, file_name) {
        Ok(rules) => rules,
        Err(err) => {
            log::warn!("Failed to get ignore file in {}: {}", dir.display(), err);
            inherited.clone()
        }
    }
}

/// Rules in effect for `dir`, accumulated from `root` down through every intermediate directory.
pub fn resolve_chain(root: &Path, dir: &Path, file_name: &str) -> IgnoreRules {
    let mut rules = IgnoreRules::default();
    let Ok(relative) = dir.strip_prefix(root) else {
        return resolve_lenient(&rules, dir, file_name);
    };
    let mut current = root.to_path_buf();
    rules = resolve_lenient(&rules, &current, file_name);
    for component in relative.components() {
        current.push(component);
        rules = resolve_lenient(&rules, &current, file_name);
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const IGNORE: &str = ".photoignore";

    #[test]
    fn directory_pattern_excludes_subtree() {
        let rules = IgnoreRules::default()
            .extend(Path::new("/photos/Family"), &["secret/".to_string()])
            .unwrap();
        assert!(rules.is_ignored(Path::new("/photos/Family/secret"), true));
        assert!(rules.is_ignored(Path::new("/photos/Family/secret/a.jpg"), false));
        assert!(!rules.is_ignored(Path::new("/photos/Family/secret"), false));
        assert!(!rules.is_ignored(Path::new("/photos/Family/public/a.jpg"), false));
    }

    #[test]
    fn layers_only_apply_below_their_directory() {
        let rules = IgnoreRules::default()
            .extend(Path::new("/photos/Family"), &["*.png".to_string()])
            .unwrap();
        assert!(rules.is_ignored(Path::new("/photos/Family/x/y.png"), false));
        assert!(!rules.is_ignored(Path::new("/photos/Work/y.png"), false));
    }

    #[test]
    fn inherited_layers_accumulate() {
        let parent = IgnoreRules::default()
            .extend(Path::new("/p"), &["*.raw".to_string()])
            .unwrap();
        let child = parent
            .extend(Path::new("/p/2020"), &["drafts/".to_string(), "# note".to_string()])
            .unwrap();
        assert_eq!(child.pattern_count(), 2);
        assert!(child.is_ignored(Path::new("/p/2020/a.raw"), false));
        assert!(child.is_ignored(Path::new("/p/2020/drafts"), true));
        assert!(!parent.is_ignored(Path::new("/p/2020/drafts"), true));
    }

    #[test]
    fn missing_ignore_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_local_ignore(dir.path(), IGNORE).unwrap().is_empty());
    }

    #[test]
    fn unreadable_ignore_file_falls_back_to_inherited() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(IGNORE)).unwrap();
        let inherited = IgnoreRules::default()
            .extend(dir.path(), &["*.png".to_string()])
            .unwrap();

        assert!(matches!(resolve(&inherited, dir.path(), IGNORE), Err(Error::IoAt { .. })));
        let rules = resolve_lenient(&inherited, dir.path(), IGNORE);
        assert_eq!(rules.pattern_count(), 1);
        assert!(rules.is_ignored(&dir.path().join("a.png"), false));
    }

    #[test]
    fn resolve_chain_reads_every_level() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("Family");
        let nested = root.join("2020").join("summer");
        fs::create_dir_all(&nested).unwrap();
        fs::write(root.join(IGNORE), "*.png\n").unwrap();
        fs::write(root.join("2020").join(IGNORE), "rejects/\n").unwrap();

        let rules = resolve_chain(&root, &nested, IGNORE);
        assert!(rules.is_ignored(&nested.join("a.png"), false));
        assert!(rules.is_ignored(&nested.join("rejects"), true));
        assert!(!rules.is_ignored(&nested.join("a.jpg"), false));
    }
}
