use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::ExperimentId;
use crate::error::HarvestError;

pub const DOCUMENT_FILENAME: &str = "mets_upload.xml";

#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn catalog_path(&self) -> Utf8PathBuf {
        self.root.join("catalog.json")
    }

    pub fn lock_dir(&self) -> Utf8PathBuf {
        self.root.join("locks")
    }

    pub fn experiment_dir(&self, id: ExperimentId) -> Utf8PathBuf {
        self.root.join("experiments").join(id.to_string())
    }

    pub fn document_path(&self, id: ExperimentId) -> Utf8PathBuf {
        self.experiment_dir(id).join(DOCUMENT_FILENAME)
    }

    pub fn ensure_root(&self) -> Result<(), HarvestError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))
    }

    pub fn get_or_create_experiment_dir(
        &self,
        id: ExperimentId,
    ) -> Result<Utf8PathBuf, HarvestError> {
        let dir = self.experiment_dir(id);
        fs::create_dir_all(dir.as_std_path())
            .map_err(|err| HarvestError::Filesystem(format!("create {dir}: {err}")))?;
        Ok(dir)
    }

    pub fn write_document(
        &self,
        id: ExperimentId,
        content: &[u8],
    ) -> Result<Utf8PathBuf, HarvestError> {
        self.get_or_create_experiment_dir(id)?;
        let path = self.document_path(id);
        Self::write_bytes_atomic(&path, content)?;
        Ok(path)
    }

    pub fn remove_experiment_dir(&self, id: ExperimentId) -> Result<(), HarvestError> {
        let dir = self.experiment_dir(id);
        if dir.as_std_path().exists() {
            fs::remove_dir_all(dir.as_std_path())
                .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), HarvestError> {
        let parent = path
            .parent()
            .ok_or_else(|| HarvestError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix("repos-consumer")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        temp.write_all(content)
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let store = Store::new(Utf8PathBuf::from("/srv/harvest"));
        let id = ExperimentId(7);

        assert_eq!(store.catalog_path(), "/srv/harvest/catalog.json");
        assert!(store.experiment_dir(id).ends_with("experiments/7"));
        assert!(store.document_path(id).ends_with("experiments/7/mets_upload.xml"));
    }

    #[test]
    fn write_document_replaces_content() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = Store::new(root);
        let id = ExperimentId(1);

        store.write_document(id, b"first").unwrap();
        let path = store.write_document(id, b"second").unwrap();

        assert_eq!(std::fs::read(path.as_std_path()).unwrap(), b"second");
        store.remove_experiment_dir(id).unwrap();
        assert!(!store.experiment_dir(id).as_std_path().exists());
    }
}
