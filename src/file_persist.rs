use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::persist::{PersistError, Persister};

const STATE_FILE: &str = "state.json";

/// Disk-backed persister: the whole hard-state blob lives in one file
/// under `dir`, replaced atomically on every save. Write a temp file,
/// fsync it, rename over the target, then fsync the directory so the
/// rename survives a crash. `read` after any crash therefore yields the
/// last fully written blob.
pub struct FilePersister {
    dir: PathBuf,
}

impl FilePersister {
    /// Open (or create) the state directory. First boot leaves no file;
    /// `read` then reports an empty store.
    pub fn open(dir: &Path) -> Result<Self, PersistError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }
}

impl Persister for FilePersister {
    fn save(&mut self, blob: &[u8]) -> Result<(), PersistError> {
        let tmp = self.dir.join(format!("{STATE_FILE}.tmp"));
        let mut file = File::create(&tmp)?;
        file.write_all(blob)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, self.state_path())?;
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    fn read(&self) -> Result<Option<Vec<u8>>, PersistError> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(&path)?))
    }
}
