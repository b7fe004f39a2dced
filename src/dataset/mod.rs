//! Dataset loading: resolves a dataset reference from the job config into
//! a list of validated tasks, either from a local directory or through a
//! task registry.

use std::path::Path;

use tracing::{debug, info};

use crate::error::DatasetError;
use crate::models::{Dataset, DatasetRef};
use crate::registry;
use crate::task::{load_task, validate_task};

/// Loads datasets from local paths or registries. The registry resolver
/// is created lazily on the first registry reference.
#[derive(Default)]
pub struct DatasetLoader {
    resolver: Option<registry::Resolver>,
}

impl DatasetLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves one dataset reference into a loaded dataset.
    pub async fn load(&mut self, dataset_ref: &DatasetRef) -> Result<Dataset, DatasetError> {
        if let Some(path) = dataset_ref.path.as_deref().filter(|p| !p.is_empty()) {
            return self.load_from_path(path).await;
        }
        if let Some(registry_ref) = &dataset_ref.registry {
            let name = dataset_ref.name.as_deref().unwrap_or_default();
            let version = dataset_ref.version.as_deref().unwrap_or_default();
            return self.load_from_registry(registry_ref, name, version).await;
        }
        Err(DatasetError::UnresolvableRef)
    }

    /// Loads all tasks from a local dataset directory. Every immediate
    /// subdirectory is a task; the dataset name is the directory base
    /// name. Tasks are ordered by name so trial enumeration is stable.
    pub async fn load_from_path(&self, dataset_path: &str) -> Result<Dataset, DatasetError> {
        let abs_path = std::path::absolute(Path::new(dataset_path))?;
        debug!(path = %abs_path.display(), "loading dataset from path");

        let mut entries: Vec<_> = std::fs::read_dir(&abs_path)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|e| e.path().is_dir())
            .collect();
        entries.sort_by_key(|e| e.file_name());

        let mut tasks = Vec::new();
        for entry in entries {
            let task_path = entry.path();
            debug!(task = %entry.file_name().to_string_lossy(), "loading task");
            let task = load_task(&task_path).await?;
            validate_task(&task)?;
            tasks.push(task);
        }

        if tasks.is_empty() {
            return Err(DatasetError::Empty(abs_path));
        }

        let name = abs_path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "dataset".to_string());

        info!(name = %name, tasks = tasks.len(), "loaded dataset");
        Ok(Dataset {
            name,
            version: None,
            tasks,
        })
    }

    /// Loads a dataset from a registry (local file or URL).
    pub async fn load_from_registry(
        &mut self,
        registry_ref: &crate::models::RegistryRef,
        name: &str,
        version: &str,
    ) -> Result<Dataset, DatasetError> {
        let resolver = match self.resolver.take() {
            Some(resolver) => self.resolver.insert(resolver),
            None => {
                let resolver = registry::Resolver::new()?;
                info!(path = %resolver.base_dir().display(), "registry clones will be stored in");
                self.resolver.insert(resolver)
            }
        };

        let datasets = if let Some(path) = registry_ref.path.as_deref().filter(|p| !p.is_empty()) {
            debug!(path, "loading registry from path");
            registry::load_from_path(path).map_err(DatasetError::Registry)?
        } else if let Some(url) = registry_ref.url.as_deref().filter(|u| !u.is_empty()) {
            debug!(url, "loading registry from URL");
            registry::load_from_url(url).await.map_err(DatasetError::Registry)?
        } else {
            return Err(DatasetError::Registry(
                crate::error::RegistryError::MissingSource,
            ));
        };

        let registry_dataset =
            registry::find_dataset(&datasets, name, version).map_err(DatasetError::Registry)?;
        let tasks = resolver
            .resolve(registry_dataset)
            .await
            .map_err(DatasetError::Registry)?;

        Ok(Dataset {
            name: registry_dataset.name.clone(),
            version: if registry_dataset.version.is_empty() {
                None
            } else {
                Some(registry_dataset.version.clone())
            },
            tasks,
        })
    }
}
