use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, bail};

/// Lock files older than this are assumed to belong to a crashed run.
const STALE_AFTER: Duration = Duration::from_secs(60 * 60);

/// Exclusive marker preventing two runs against the same database.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn for_database(db_path: &Path) -> Result<Self> {
        let mut name = db_path.as_os_str().to_owned();
        name.push(".lock");
        Self::acquire(PathBuf::from(name))
    }

    pub fn acquire(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed creating lock directory {}", parent.display()))?;
        }
        match create(&path) {
            Ok(()) => return Ok(Self { path }),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => {
                return Err(err).with_context(|| format!("Failed creating lock {}", path.display()));
            }
        }
        if !is_stale(&path) {
            bail!(
                "Another run holds {}; remove it if no other instance is running",
                path.display()
            );
        }
        log::warn!("Removing stale lock {}", path.display());
        fs::remove_file(&path)
            .with_context(|| format!("Failed removing stale lock {}", path.display()))?;
        create(&path).with_context(|| format!("Failed creating lock {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            log::warn!("Failed removing lock {}: {err}", self.path.display());
        }
    }
}

fn create(path: &Path) -> std::io::Result<()> {
    let mut file = File::create_new(path)?;
    writeln!(file, "{}", std::process::id())
}

fn is_stale(path: &Path) -> bool {
    let modified = fs::metadata(path).and_then(|meta| meta.modified());
    match modified {
        Ok(modified) => SystemTime::now()
            .duration_since(modified)
            .is_ok_and(|age| age > STALE_AFTER),
        Err(_) => false,
    }
}
