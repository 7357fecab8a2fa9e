use std::{collections::BTreeMap, path::Path};

use anyhow::{Context, Result};
use async_trait::async_trait;
use data_model::{AppId, AppState, DesiredAppState};
use tokio::sync::RwLock;
use tracing::info;

/// Source of the desired state of every application.
#[async_trait]
pub trait DesiredStateStore: Send + Sync + 'static {
    async fn list_apps(&self) -> Result<Vec<DesiredAppState>>;

    async fn get_app(&self, app_id: &AppId) -> Result<Option<DesiredAppState>>;

    /// Records that the app should no longer run.
    async fn mark_stopped(&self, app_id: &AppId) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryDesiredStateStore {
    apps: RwLock<BTreeMap<AppId, DesiredAppState>>,
}

impl InMemoryDesiredStateStore {
    pub fn new(apps: Vec<DesiredAppState>) -> Self {
        Self {
            apps: RwLock::new(
                apps.into_iter()
                    .map(|app| (app.app_id.clone(), app))
                    .collect(),
            ),
        }
    }

    /// Loads a YAML list of apps.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading desired state from {}", path.display()))?;
        let apps: Vec<DesiredAppState> = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing desired state from {}", path.display()))?;
        info!(apps = apps.len(), path = %path.display(), "loaded desired state");
        Ok(Self::new(apps))
    }

    pub async fn upsert(&self, app: DesiredAppState) {
        self.apps.write().await.insert(app.app_id.clone(), app);
    }

    pub async fn remove(&self, app_id: &AppId) -> Option<DesiredAppState> {
        self.apps.write().await.remove(app_id)
    }
}

#[async_trait]
impl DesiredStateStore for InMemoryDesiredStateStore {
    async fn list_apps(&self) -> Result<Vec<DesiredAppState>> {
        Ok(self.apps.read().await.values().cloned().collect())
    }

    async fn get_app(&self, app_id: &AppId) -> Result<Option<DesiredAppState>> {
        Ok(self.apps.read().await.get(app_id).cloned())
    }

    async fn mark_stopped(&self, app_id: &AppId) -> Result<()> {
        if let Some(app) = self.apps.write().await.get_mut(app_id) {
            app.state = AppState::Stopped;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use data_model::{test_objects::tests::mock_app, PackageState};

    use super::*;

    #[tokio::test]
    async fn test_yaml_seed_and_mark_stopped() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(
            file,
            r#"
- app_id: 7
  name: hello
  instance_count: 2
  package_state: STAGED
  staged_package_hash: abc
  runtime: ruby19
  framework: sinatra
  last_updated: 1700000000
  limits: {{mem: 128, disk: 1024, fds: 64}}
"#
        )?;
        let store = InMemoryDesiredStateStore::from_yaml_file(file.path())?;
        let app_id = AppId::from("7");
        let app = store.get_app(&app_id).await?.unwrap();
        assert_eq!(app.version(), "abc-0");
        assert_eq!(app.package_state, PackageState::Staged);
        assert!(app.is_started());
        assert_eq!(app.limits.mem, 128);

        store.mark_stopped(&app_id).await?;
        assert!(!store.get_app(&app_id).await?.unwrap().is_started());
        Ok(())
    }

    #[tokio::test]
    async fn test_upsert_and_remove() -> Result<()> {
        let store = InMemoryDesiredStateStore::default();
        store.upsert(mock_app("1", 1)).await;
        store.upsert(mock_app("2", 1)).await;
        assert_eq!(store.list_apps().await?.len(), 2);
        store.remove(&AppId::from("1")).await;
        assert_eq!(store.list_apps().await?.len(), 1);
        assert!(store.get_app(&AppId::from("1")).await?.is_none());
        Ok(())
    }
}
