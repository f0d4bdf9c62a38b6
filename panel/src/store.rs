use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use ledpanel_common::{ConfigStore, PanelError, Result};

pub const CONFIG_FILE: &str = "config.json";

/// Config document kept as a single file; writes go through a temp file and a rename.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn storage_error(&self, action: &str, err: std::io::Error) -> PanelError {
        PanelError::Storage(format!("{action} {}: {err}", self.path.display()))
    }
}

impl ConfigStore for FileStore {
    fn load_raw(&mut self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(self.storage_error("reading", err)),
        }
    }

    fn save_raw(&mut self, payload: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| self.storage_error("creating dir for", err))?;
        }

        let temp = self.path.with_extension("tmp");
        fs::write(&temp, payload).map_err(|err| self.storage_error("writing", err))?;
        fs::rename(&temp, &self.path).map_err(|err| self.storage_error("replacing", err))
    }

    fn remount(&mut self) -> Result<()> {
        Ok(())
    }
}
