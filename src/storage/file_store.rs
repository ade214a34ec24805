//! Immutable TSM file set
//!
//! The file store owns the shard's set of sorted, immutable TSM files.
//! [`FileStore::replace`] swaps files in and out atomically from a reader's
//! perspective: every call to [`FileStore::files`] or [`FileStore::apply`]
//! sees either the pre-replace or the post-replace set, never a mix.
//! [`FileStore::apply`] fans per-file work out across blocking worker
//! threads.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::engine::traits::{TsmFile, TsmFileOpener};
use crate::error::{EngineError, Result};
use crate::metrics;
use crate::sync::FixedLimiter;

/// Extension of TSM files
pub const TSM_FILE_EXTENSION: &str = "tsm";

/// Extension marking in-progress TSM files and stale snapshot directories
pub const TMP_FILE_EXTENSION: &str = "tmp";

/// Set of immutable sorted TSM files with atomic replace and parallel apply
pub struct FileStore {
    dir: PathBuf,
    opener: Arc<dyn TsmFileOpener>,
    files: RwLock<Vec<Arc<dyn TsmFile>>>,
    last_modified: Mutex<SystemTime>,
    open_limiter: FixedLimiter,
    // Forwarded to the opener so mapped files are prefetched.
    madv_will_need: bool,
}

impl FileStore {
    /// Create a file store over `dir`, opening files through `opener` with
    /// at most `max_concurrent_opens` opens in flight during startup.
    /// `madv_will_need` asks openers to advise the kernel that file pages
    /// will be needed soon.
    pub fn new(
        dir: impl Into<PathBuf>,
        opener: Arc<dyn TsmFileOpener>,
        max_concurrent_opens: usize,
        madv_will_need: bool,
    ) -> Self {
        Self {
            dir: dir.into(),
            opener,
            files: RwLock::new(Vec::new()),
            last_modified: Mutex::new(SystemTime::UNIX_EPOCH),
            open_limiter: FixedLimiter::new(max_concurrent_opens.max(1)),
            madv_will_need,
        }
    }

    /// Directory the TSM files live in
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Scan the directory and open every TSM file
    pub async fn open(&self) -> Result<()> {
        let mut paths = Vec::new();
        if self.dir.exists() {
            for dent in fs::read_dir(&self.dir)? {
                let dent = dent?;
                let path = dent.path();
                if path.is_file()
                    && path
                        .extension()
                        .map(|e| e == TSM_FILE_EXTENSION)
                        .unwrap_or(false)
                {
                    paths.push(path);
                }
            }
        }
        paths.sort();

        let mut latest = SystemTime::UNIX_EPOCH;
        for path in &paths {
            if let Ok(modified) = fs::metadata(path).and_then(|m| m.modified()) {
                latest = latest.max(modified);
            }
        }

        let mut handles = Vec::with_capacity(paths.len());
        for path in paths {
            let opener = Arc::clone(&self.opener);
            let madv_will_need = self.madv_will_need;
            let permit = loop {
                match self.open_limiter.try_take() {
                    Some(permit) => break permit,
                    None => tokio::task::yield_now().await,
                }
            };
            handles.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                opener.open(&path, madv_will_need)
            }));
        }

        let mut files = Vec::with_capacity(handles.len());
        for joined in futures::future::join_all(handles).await {
            let file = joined.map_err(|e| EngineError::Io(io::Error::other(e.to_string())))??;
            files.push(file);
        }

        debug!(dir = %self.dir.display(), files = files.len(), "opened file store");
        let count = files.len();
        *self.files.write() = files;
        if latest > SystemTime::UNIX_EPOCH {
            *self.last_modified.lock() = latest;
        }
        metrics::FILE_STORE_FILES.set(count as f64);
        metrics::FILE_STORE_SIZE_BYTES.set(self.disk_size_bytes() as f64);
        Ok(())
    }

    /// Close every file and drop the set
    pub fn close(&self) -> Result<()> {
        let files = std::mem::take(&mut *self.files.write());
        for file in files {
            file.close()?;
        }
        Ok(())
    }

    /// Number of files in the store
    pub fn count(&self) -> usize {
        self.files.read().len()
    }

    /// Snapshot of the current file set
    pub fn files(&self) -> Vec<Arc<dyn TsmFile>> {
        self.files.read().clone()
    }

    /// Paths of the current file set
    pub fn file_paths(&self) -> Vec<PathBuf> {
        self.files
            .read()
            .iter()
            .map(|f| f.path().to_path_buf())
            .collect()
    }

    /// Sizes of every file summed
    pub fn disk_size_bytes(&self) -> u64 {
        self.files.read().iter().map(|f| f.size()).sum()
    }

    /// Wall-clock time the file set last changed
    pub fn last_modified(&self) -> SystemTime {
        *self.last_modified.lock()
    }

    /// Atomically swap `old` files out of the set and `new` files in.
    ///
    /// New files carry the in-progress `.tmp` suffix from the compactor and
    /// are renamed into place first. Old files are closed and deleted from
    /// disk after the swap.
    pub fn replace(&self, old: &[PathBuf], new: &[PathBuf]) -> Result<()> {
        self.replace_with_callback(old, new)
    }

    /// [`FileStore::replace`]; kept as a separate name so call sites mirror
    /// the compaction strategy's contract
    pub fn replace_with_callback(&self, old: &[PathBuf], new: &[PathBuf]) -> Result<()> {
        if old.is_empty() && new.is_empty() {
            return Ok(());
        }

        // Rename temp files into their final names, then open them before
        // touching the published set.
        let mut opened = Vec::with_capacity(new.len());
        for path in new {
            let final_path = match path.extension() {
                Some(ext) if ext == TMP_FILE_EXTENSION => {
                    let renamed = path.with_extension("");
                    fs::rename(path, &renamed)?;
                    renamed
                }
                _ => path.clone(),
            };
            opened.push(self.opener.open(&final_path, self.madv_will_need)?);
        }

        let removed = {
            let mut files = self.files.write();
            let mut removed = Vec::new();
            files.retain(|f| {
                if old.iter().any(|o| o.as_path() == f.path()) {
                    removed.push(Arc::clone(f));
                    false
                } else {
                    true
                }
            });
            files.extend(opened);
            files.sort_by(|a, b| a.path().cmp(b.path()));
            removed
        };

        for file in removed {
            file.close()?;
            match fs::remove_file(file.path()) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        *self.last_modified.lock() = SystemTime::now();
        metrics::FILE_STORE_FILES.set(self.count() as f64);
        metrics::FILE_STORE_SIZE_BYTES.set(self.disk_size_bytes() as f64);
        Ok(())
    }

    /// Run `f` against every file in parallel on blocking worker threads,
    /// returning the first error encountered.
    pub async fn apply<F>(&self, f: F) -> Result<()>
    where
        F: Fn(Arc<dyn TsmFile>) -> Result<()> + Send + Sync + 'static,
    {
        let files = self.files();
        let f = Arc::new(f);

        let mut handles = Vec::with_capacity(files.len());
        for file in files {
            let f = Arc::clone(&f);
            handles.push(tokio::task::spawn_blocking(move || f(file)));
        }

        let mut first_err = None;
        for joined in futures::future::join_all(handles).await {
            let result = joined.map_err(|e| EngineError::Io(io::Error::other(e.to_string())))?;
            if let Err(e) = result {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
