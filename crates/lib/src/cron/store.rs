//! JSON job store, written atomically under an advisory lock so the CLI and a running
//! gateway can share it.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::types::CronJob;
use super::CronError;

const STORE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    jobs: Vec<CronJob>,
}

fn default_version() -> u32 {
    STORE_VERSION
}

#[derive(Debug, Clone)]
pub struct CronStore {
    path: PathBuf,
}

impl CronStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    fn open_lock(&self) -> Result<File, CronError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())?)
    }

    /// All stored jobs. A missing file is an empty store.
    pub fn load(&self) -> Result<Vec<CronJob>, CronError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let lock = self.open_lock()?;
        FileExt::lock_shared(&lock)?;
        let result = std::fs::read_to_string(&self.path);
        let _ = FileExt::unlock(&lock);
        let data = result?;
        if data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let file: StoreFile = serde_json::from_str(&data)
            .map_err(|e| CronError::Store(format!("{}: {}", self.path.display(), e)))?;
        Ok(file.jobs)
    }

    /// Load, apply `f`, and write the result back, all under one exclusive lock. The write goes
    /// to a temp file next to the store that is then renamed over it. Nothing is written when
    /// `f` fails.
    pub fn update<T>(
        &self,
        f: impl FnOnce(&mut Vec<CronJob>) -> Result<T, CronError>,
    ) -> Result<T, CronError> {
        let lock = self.open_lock()?;
        FileExt::lock_exclusive(&lock)?;
        let result = (|| -> Result<T, CronError> {
            let mut jobs = if self.path.exists() {
                let data = std::fs::read_to_string(&self.path)?;
                if data.trim().is_empty() {
                    Vec::new()
                } else {
                    serde_json::from_str::<StoreFile>(&data)
                        .map_err(|e| CronError::Store(format!("{}: {}", self.path.display(), e)))?
                        .jobs
                }
            } else {
                Vec::new()
            };
            let out = f(&mut jobs)?;
            self.write_atomic(&jobs)?;
            Ok(out)
        })();
        let _ = FileExt::unlock(&lock);
        result
    }

    fn write_atomic(&self, jobs: &[CronJob]) -> Result<(), CronError> {
        let file = StoreFile {
            version: STORE_VERSION,
            jobs: jobs.to_vec(),
        };
        let body = serde_json::to_string_pretty(&file)
            .map_err(|e| CronError::Store(e.to_string()))?;
        let tmp = self.path.with_extension(format!("tmp.{}", std::process::id()));
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
