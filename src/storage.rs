use std::fs;
use std::io::Write;
use std::marker::PhantomData;
use std::path::PathBuf;

use crate::error::Error;

/// Persistent snapshot storage for failure recovery.
///
/// Each save replaces the previous snapshot wholesale: the state is
/// serialized to a temporary file, flushed, and renamed over the old
/// snapshot so a crash mid-write never leaves a torn file behind.
pub(crate) struct Storage<S> {
    path: PathBuf,
    _marker: PhantomData<S>,
}

impl<S> Storage<S> {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Storage {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    /// Remove the snapshot. Succeeds if none exists.
    pub fn clear(&self) -> Result<(), Error> {
        match fs::remove_file(&self.path) {
        | Ok(()) => Ok(()),
        | Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        | Err(error) => Err(error.into()),
        }
    }
}

impl<S: serde::de::DeserializeOwned> Storage<S> {
    /// Load the latest snapshot, or `None` for a fresh node.
    pub fn load(&self) -> Result<Option<S>, Error> {
        let bytes = match fs::read(&self.path) {
        | Ok(bytes) => bytes,
        | Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        | Err(error) => return Err(error.into()),
        };
        bincode::deserialize(&bytes).map(Some).map_err(Error::from)
    }
}

impl<S: serde::Serialize> Storage<S> {
    pub fn save(&self, state: &S) -> Result<(), Error> {
        if let Some(directory) = self.path.parent() {
            fs::create_dir_all(directory)?;
        }
        let staging = self.path.with_extension("tmp");
        let mut file = fs::File::create(&staging)?;
        file.write_all(&bincode::serialize(state)?)?;
        file.sync_all()?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as Map;

    use super::*;

    #[test]
    fn missing_snapshot_is_fresh() {
        let directory = tempfile::tempdir().unwrap();
        let storage: Storage<Map<usize, usize>> = Storage::new(directory.path().join("node-00.bak"));
        assert!(storage.load().unwrap().is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let directory = tempfile::tempdir().unwrap();
        let storage: Storage<Map<usize, usize>> = Storage::new(directory.path().join("node-00.bak"));

        let mut state = Map::new();
        state.insert(3, 5);
        storage.save(&state).unwrap();
        assert_eq!(storage.load().unwrap(), Some(state.clone()));

        state.insert(0, 7);
        storage.save(&state).unwrap();
        assert_eq!(storage.load().unwrap(), Some(state));
    }

    #[test]
    fn clear_tolerates_missing_file() {
        let directory = tempfile::tempdir().unwrap();
        let storage: Storage<Vec<usize>> = Storage::new(directory.path().join("node-00.bak"));
        storage.clear().unwrap();

        storage.save(&vec![1, 2, 3]).unwrap();
        storage.clear().unwrap();
        assert!(storage.load().unwrap().is_none());
    }
}
