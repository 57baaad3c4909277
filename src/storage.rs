//! Crash-safe storage of service artifacts
//!
//! Every service owns two text files in the working directory,
//! `{name}.config.py` and `{name}.handler.py`. Each file is replaced through a
//! staged temporary file in the same directory followed by a rename, so a
//! concurrent reader sees either the old or the new content in full.

use crate::service::validate_name;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

/// Token replaced with the absolute working directory before persisting
pub const WORK_DIR_PLACEHOLDER: &str = "$WORK_DIR";
pub const CONFIG_SUFFIX: &str = ".config.py";
pub const HANDLER_SUFFIX: &str = ".handler.py";
const STAGING_PREFIX: &str = ".staging-";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no persisted artifacts for service '{0}'")]
    NotFound(String),

    #[error("invalid service name: {0}")]
    InvalidName(String),

    #[error("failed to {action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_error(action: &'static str, path: &Path, source: io::Error) -> StorageError {
    StorageError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

/// Config and handler text as stored on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPair {
    pub config: String,
    pub handler: String,
}

/// A persisted entry that could not be loaded during a scan
#[derive(Debug)]
pub struct ScanSkip {
    pub file: PathBuf,
    pub reason: String,
}

/// The working directory holding every service's artifact pair
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    /// Relative roots are anchored at the current directory so placeholder
    /// substitution always yields an absolute path.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = if root.is_relative() {
            std::env::current_dir()
                .map(|cwd| cwd.join(&root))
                .unwrap_or(root)
        } else {
            root
        };
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}{}", name, CONFIG_SUFFIX))
    }

    pub fn handler_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}{}", name, HANDLER_SUFFIX))
    }

    /// Replace every occurrence of the placeholder with the working directory
    pub fn substitute(&self, text: &str) -> String {
        text.replace(WORK_DIR_PLACEHOLDER, &self.root.to_string_lossy())
    }

    fn check_name(name: &str) -> Result<(), StorageError> {
        validate_name(name).map_err(StorageError::InvalidName)
    }

    /// Create the working directory; safe to race with other creators.
    fn ensure_dir(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root).map_err(|e| io_error("create", &self.root, e))
    }

    fn stage(&self, target: &Path, contents: &[u8]) -> Result<NamedTempFile, StorageError> {
        let mut file = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(".tmp")
            .tempfile_in(&self.root)
            .map_err(|e| io_error("stage", target, e))?;
        file.write_all(contents)
            .map_err(|e| io_error("write", file.path(), e))?;
        file.as_file()
            .sync_all()
            .map_err(|e| io_error("sync", file.path(), e))?;
        Ok(file)
    }

    fn commit(staged: NamedTempFile, target: &Path) -> Result<(), StorageError> {
        staged
            .persist(target)
            .map(|_| ())
            .map_err(|e| io_error("rename into", target, e.error))
    }

    fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read", path, e)),
        }
    }

    /// Put the config file back the way it was before a failed pair write
    fn restore(&self, path: &Path, previous: Option<Vec<u8>>) {
        let result = match previous {
            Some(bytes) => self
                .stage(path, &bytes)
                .and_then(|staged| Self::commit(staged, path)),
            None => fs::remove_file(path).map_err(|e| io_error("remove", path, e)),
        };
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to roll back config after pair write failure");
        }
    }

    /// Substitute the placeholder in both blobs and persist them as a pair.
    ///
    /// Both files are staged before either rename. If the handler cannot be
    /// renamed into place the config is rolled back, so an error never
    /// leaves a new config next to a stale or missing handler.
    pub fn write_pair(
        &self,
        name: &str,
        config: &str,
        handler: &str,
    ) -> Result<StoredPair, StorageError> {
        Self::check_name(name)?;
        let pair = StoredPair {
            config: self.substitute(config),
            handler: self.substitute(handler),
        };

        self.ensure_dir()?;
        let config_path = self.config_path(name);
        let handler_path = self.handler_path(name);

        let staged_config = self.stage(&config_path, pair.config.as_bytes())?;
        let staged_handler = self.stage(&handler_path, pair.handler.as_bytes())?;
        let previous_config = Self::read_optional(&config_path)?;

        Self::commit(staged_config, &config_path)?;
        if let Err(e) = Self::commit(staged_handler, &handler_path) {
            self.restore(&config_path, previous_config);
            return Err(e);
        }

        debug!(service = name, dir = %self.root.display(), "Persisted service artifacts");
        Ok(pair)
    }

    /// Read both artifacts; `NotFound` if either one is missing
    pub fn read_pair(&self, name: &str) -> Result<StoredPair, StorageError> {
        Self::check_name(name)?;
        let read = |path: PathBuf| {
            fs::read_to_string(&path).map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    StorageError::NotFound(name.to_string())
                } else {
                    io_error("read", &path, e)
                }
            })
        };

        Ok(StoredPair {
            config: read(self.config_path(name))?,
            handler: read(self.handler_path(name))?,
        })
    }

    /// Remove both artifacts. A half-present pair is cleaned up without error.
    pub fn delete_pair(&self, name: &str) -> Result<(), StorageError> {
        Self::check_name(name)?;
        let mut removed = 0;
        for path in [self.config_path(name), self.handler_path(name)] {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error("remove", &path, e)),
            }
        }

        if removed == 0 {
            return Err(StorageError::NotFound(name.to_string()));
        }
        Ok(())
    }

    /// Remove staging files left behind by an interrupted write.
    ///
    /// Only safe while no pair write is in flight, i.e. before serving.
    /// Returns how many files were removed.
    pub fn remove_stale_staging(&self) -> Result<usize, StorageError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_error("list", &self.root, e)),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| io_error("list", &self.root, e))?;
            let is_staging = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(STAGING_PREFIX));
            if !is_staging {
                continue;
            }
            let path = entry.path();
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(file = %path.display(), "Removed stale staging file");
                    removed += 1;
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Failed to remove stale staging file");
                }
            }
        }
        Ok(removed)
    }

    /// Lazily walk the working directory for persisted pairs.
    ///
    /// A missing directory yields an empty scan.
    pub fn scan(&self) -> Result<Scan, StorageError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => Some(entries),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(io_error("list", &self.root, e)),
        };
        Ok(Scan {
            work_dir: self.clone(),
            entries,
        })
    }
}

/// Iterator over the pairs found in a working directory.
///
/// Yields `Ok((name, pair))` for each loadable pair and `Err(skip)` for each
/// config artifact that could not be loaded. Files that are not config
/// artifacts are passed over silently.
pub struct Scan {
    work_dir: WorkDir,
    entries: Option<fs::ReadDir>,
}

impl Iterator for Scan {
    type Item = Result<(String, StoredPair), ScanSkip>;

    fn next(&mut self) -> Option<Self::Item> {
        let entries = self.entries.as_mut()?;
        loop {
            let entry = match entries.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    return Some(Err(ScanSkip {
                        file: self.work_dir.root().to_path_buf(),
                        reason: format!("unreadable directory entry: {}", e),
                    }))
                }
            };

            let path = entry.path();
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                if file_name
                    .as_encoded_bytes()
                    .ends_with(CONFIG_SUFFIX.as_bytes())
                {
                    return Some(Err(ScanSkip {
                        file: path,
                        reason: "non UTF-8 file name".to_string(),
                    }));
                }
                continue;
            };
            if file_name.starts_with(STAGING_PREFIX) {
                debug!(file = %path.display(), "Ignoring staging file");
                continue;
            }
            let Some(name) = file_name.strip_suffix(CONFIG_SUFFIX) else {
                continue;
            };

            let item = self
                .work_dir
                .read_pair(name)
                .map(|pair| (name.to_string(), pair))
                .map_err(|e| ScanSkip {
                    file: path,
                    reason: e.to_string(),
                });
            return Some(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn work_dir() -> (WorkDir, TempDir) {
        let tmp = TempDir::new().unwrap();
        let work_dir = WorkDir::new(tmp.path().join("portcullis"));
        (work_dir, tmp)
    }

    #[test]
    fn test_write_creates_dir_and_substitutes() {
        let (work_dir, _tmp) = work_dir();
        assert!(!work_dir.root().exists());

        let pair = work_dir
            .write_pair("svc1", "listen $WORK_DIR/x", "h1 $WORK_DIR")
            .unwrap();

        let root = work_dir.root().display().to_string();
        assert_eq!(pair.config, format!("listen {}/x", root));
        assert_eq!(pair.handler, format!("h1 {}", root));
        assert_eq!(
            fs::read_to_string(work_dir.config_path("svc1")).unwrap(),
            pair.config
        );
        assert_eq!(
            fs::read_to_string(work_dir.handler_path("svc1")).unwrap(),
            pair.handler
        );
    }

    #[test]
    fn test_write_overwrites_and_leaves_no_staging_files() {
        let (work_dir, _tmp) = work_dir();
        work_dir.write_pair("svc1", "a", "b").unwrap();
        work_dir.write_pair("svc1", "c", "d").unwrap();

        let pair = work_dir.read_pair("svc1").unwrap();
        assert_eq!(pair.config, "c");
        assert_eq!(pair.handler, "d");

        let names: Vec<String> = fs::read_dir(work_dir.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|n| !n.starts_with(STAGING_PREFIX)));
    }

    #[test]
    fn test_relative_root_becomes_absolute() {
        let work_dir = WorkDir::new("relative/dir");
        assert!(work_dir.root().is_absolute());
        assert!(!work_dir.substitute("$WORK_DIR").starts_with("relative"));
    }

    #[test]
    fn test_handler_failure_rolls_back_new_config() {
        let (work_dir, _tmp) = work_dir();
        fs::create_dir_all(work_dir.handler_path("svc1")).unwrap();

        let result = work_dir.write_pair("svc1", "config", "handler");
        assert!(matches!(result, Err(StorageError::Io { .. })));
        assert!(!work_dir.config_path("svc1").exists());
    }

    #[test]
    fn test_handler_failure_restores_previous_config() {
        let (work_dir, _tmp) = work_dir();
        work_dir.write_pair("svc1", "old", "h").unwrap();
        fs::remove_file(work_dir.handler_path("svc1")).unwrap();
        fs::create_dir_all(work_dir.handler_path("svc1")).unwrap();

        assert!(work_dir.write_pair("svc1", "new", "h").is_err());
        assert_eq!(
            fs::read_to_string(work_dir.config_path("svc1")).unwrap(),
            "old"
        );
    }

    #[test]
    fn test_read_pair_missing_handler() {
        let (work_dir, _tmp) = work_dir();
        work_dir.write_pair("svc1", "c", "h").unwrap();
        fs::remove_file(work_dir.handler_path("svc1")).unwrap();

        assert!(matches!(
            work_dir.read_pair("svc1"),
            Err(StorageError::NotFound(name)) if name == "svc1"
        ));
    }

    #[test]
    fn test_delete_pair() {
        let (work_dir, _tmp) = work_dir();
        work_dir.write_pair("svc1", "c", "h").unwrap();

        work_dir.delete_pair("svc1").unwrap();
        assert!(!work_dir.config_path("svc1").exists());
        assert!(!work_dir.handler_path("svc1").exists());

        assert!(matches!(
            work_dir.delete_pair("svc1"),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_partial_pair_is_not_an_error() {
        let (work_dir, _tmp) = work_dir();
        work_dir.write_pair("svc1", "c", "h").unwrap();
        fs::remove_file(work_dir.config_path("svc1")).unwrap();

        assert!(work_dir.delete_pair("svc1").is_ok());
        assert!(!work_dir.handler_path("svc1").exists());
    }

    #[test]
    fn test_invalid_names_never_touch_disk() {
        let (work_dir, _tmp) = work_dir();
        assert!(matches!(
            work_dir.write_pair("../escape", "c", "h"),
            Err(StorageError::InvalidName(_))
        ));
        assert!(!work_dir.root().exists());
    }

    #[test]
    fn test_scan_missing_dir_is_empty() {
        let (work_dir, _tmp) = work_dir();
        assert_eq!(work_dir.scan().unwrap().count(), 0);
    }

    #[test]
    fn test_scan_reports_skips_individually() {
        let (work_dir, _tmp) = work_dir();
        work_dir.write_pair("good1", "c1", "h1").unwrap();
        work_dir.write_pair("good2", "c2", "h2").unwrap();
        // config without handler
        fs::write(work_dir.config_path("orphan"), "c").unwrap();
        // name that fails validation
        fs::write(work_dir.root().join("bad.name.config.py"), "c").unwrap();
        // unrelated files are ignored
        fs::write(work_dir.root().join("notes.txt"), "x").unwrap();
        fs::write(work_dir.handler_path("lonely"), "h").unwrap();

        let mut loaded = Vec::new();
        let mut skipped = Vec::new();
        for item in work_dir.scan().unwrap() {
            match item {
                Ok((name, pair)) => loaded.push((name, pair)),
                Err(skip) => skipped.push(skip),
            }
        }
        loaded.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].0, "good1");
        assert_eq!(loaded[0].1.handler, "h1");
        assert_eq!(loaded[1].0, "good2");
        assert_eq!(skipped.len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_reports_non_utf8_config_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let (work_dir, _tmp) = work_dir();
        work_dir.write_pair("good", "c", "h").unwrap();
        let bad = work_dir
            .root()
            .join(OsStr::from_bytes(b"bad\xff.config.py"));
        fs::write(&bad, "c").unwrap();
        // non UTF-8 names without the config suffix are not artifacts
        fs::write(work_dir.root().join(OsStr::from_bytes(b"junk\xff")), "x").unwrap();

        let (loaded, skipped): (Vec<_>, Vec<_>) =
            work_dir.scan().unwrap().partition(|item| item.is_ok());

        assert_eq!(loaded.len(), 1);
        assert_eq!(skipped.len(), 1);
        let skip = skipped.into_iter().next().unwrap().unwrap_err();
        assert_eq!(skip.file, bad);
        assert_eq!(skip.reason, "non UTF-8 file name");
    }

    #[test]
    fn test_remove_stale_staging() {
        let (work_dir, _tmp) = work_dir();
        assert_eq!(work_dir.remove_stale_staging().unwrap(), 0);

        work_dir.write_pair("svc1", "c", "h").unwrap();
        let stale = work_dir.root().join(".staging-abc123.tmp");
        fs::write(&stale, "half written").unwrap();

        // staging files are never reported as entries
        assert_eq!(work_dir.scan().unwrap().count(), 1);

        assert_eq!(work_dir.remove_stale_staging().unwrap(), 1);
        assert!(!stale.exists());
        assert_eq!(work_dir.read_pair("svc1").unwrap().config, "c");
    }
}
