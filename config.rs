use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseDriver {
    #[default]
    Sqlite,
}

impl DatabaseDriver {
    /// Upper bound on concurrent writers the backend tolerates, if any.
    pub fn max_writers(self) -> Option<usize> {
        match self {
            DatabaseDriver::Sqlite => Some(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_concurrent_workers")]
    pub concurrent_workers: usize,
    #[serde(default = "default_ignore_file_name")]
    pub ignore_file_name: String,
    #[serde(default = "default_retouch_marker")]
    pub retouch_marker: String,
    #[serde(default = "default_temp_suffix")]
    pub temp_suffix: String,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            concurrent_workers: default_concurrent_workers(),
            ignore_file_name: default_ignore_file_name(),
            retouch_marker: default_retouch_marker(),
            temp_suffix: default_temp_suffix(),
        }
    }
}

impl ScannerConfig {
    /// Number of crawl/watch workers allowed against `driver`.
    pub fn effective_workers(&self, driver: DatabaseDriver) -> Result<usize> {
        if self.concurrent_workers < 1 {
            return Err(Error::Config(
                "concurrent workers must at least be 1".to_string(),
            ));
        }
        if let Some(max) = driver.max_writers() {
            if self.concurrent_workers > max {
                return Err(Error::Config(format!(
                    "{} concurrent workers requested but the {:?} backend supports only {}",
                    self.concurrent_workers, driver, max
                )));
            }
        }
        Ok(self.concurrent_workers)
    }
}

fn default_concurrent_workers() -> usize {
    1
}

fn default_ignore_file_name() -> String {
    ".photoignore".to_string()
}

fn default_retouch_marker() -> String {
    "~".to_string()
}

fn default_temp_suffix() -> String {
    "tmp".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub database: DatabaseDriver,
}

impl Settings {
    /// Reads settings from a JSON file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                let settings: Settings = serde_json::from_str(&raw)?;
                Ok(settings)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No settings at {}; using defaults", path.display());
                Ok(Self::default())
            }
            Err(err) => Err(Error::io_at(path, err)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.scanner.effective_workers(self.database)?;
        if self.scanner.ignore_file_name.is_empty() {
            return Err(Error::Config("ignore file name must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppPaths {
    pub root: PathBuf,
    pub db_path: PathBuf,
    pub cache_dir: PathBuf,
}

impl AppPaths {
    pub fn discover(data_dir: &Path) -> Result<Self> {
        let cache_dir = data_dir.join("cache");
        std::fs::create_dir_all(&cache_dir).map_err(|err| Error::io_at(&cache_dir, err))?;

        Ok(Self {
            root: data_dir.to_path_buf(),
            db_path: data_dir.join("library.db"),
            cache_dir,
        })
    }

    /// Derived cache directory of an album.
    pub fn album_cache(&self, album_id: i64) -> PathBuf {
        self.cache_dir.join(album_id.to_string())
    }

    /// Derived cache directory of one media inside its album's cache.
    pub fn media_cache(&self, album_id: i64, media_id: i64) -> PathBuf {
        self.album_cache(album_id).join(media_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_writer_backend_rejects_multiple_workers() {
        let mut settings = Settings::default();
        settings.scanner.concurrent_workers = 2;
        match settings.validate() {
            Err(Error::Config(msg)) => assert!(msg.contains("supports only 1")),
            other => panic!("Expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn zero_workers_is_rejected() {
        let mut config = ScannerConfig::default();
        config.concurrent_workers = 0;
        assert!(config.effective_workers(DatabaseDriver::Sqlite).is_err());
    }

    #[test]
    fn missing_settings_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings.scanner.concurrent_workers, 1);
        assert_eq!(settings.scanner.ignore_file_name, ".photoignore");
        assert_eq!(settings.database, DatabaseDriver::Sqlite);
    }

    #[test]
    fn partial_settings_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "scanner": { "retouch_marker": "_final" } }"#).unwrap();
        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.scanner.retouch_marker, "_final");
        assert_eq!(settings.scanner.temp_suffix, "tmp");
    }

    #[test]
    fn cache_paths_are_keyed_by_ids() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::discover(dir.path()).unwrap();
        assert!(paths.cache_dir.is_dir());
        assert_eq!(paths.media_cache(3, 7), paths.cache_dir.join("3").join("7"));
    }
}
