//! Best-effort persistence of toggle states
//!
//! One plain file per toggle, holding exactly `ON` or `OFF`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::toggle::SwitchState;

/// Toggle states keyed by file name
///
/// ```
/// use lsc_proxy::state_store::StateStore;
/// use lsc_proxy::toggle::SwitchState;
///
/// # let dir = tempfile::tempdir().unwrap();
/// let store = StateStore::new(dir.path());
/// tokio_test::block_on(async {
///     store.save("privacy", SwitchState::On).await.unwrap();
///     assert_eq!(store.load("privacy").await.unwrap(), Some(SwitchState::On));
/// });
/// ```
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// Create the state directory if missing
    pub async fn ensure_dir(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    /// Last persisted state for `key`
    ///
    /// A missing file is created empty; empty or unrecognized content means
    /// there is no prior state.
    pub async fn load(&self, key: &str) -> std::io::Result<Option<SwitchState>> {
        let path = self.file(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(SwitchState::parse(contents.trim())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tokio::fs::write(&path, b"").await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Persist `state` for `key`, skipping the write when nothing changed
    pub async fn save(&self, key: &str, state: SwitchState) -> std::io::Result<()> {
        let path = self.file(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) if contents == state.as_str() => return Ok(()),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        tokio::fs::write(&path, state.as_str()).await
    }
}
