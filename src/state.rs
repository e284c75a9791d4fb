//! Application state management

use crate::client::{ContentClient, HttpContentClient};
use crate::config::{Config, SettingsSource, StaticSettings};
use crate::downloader::DownloadOrchestrator;
use crate::error::Result;
use crate::resolver::CacheResolver;
use crate::store::Store;
use crate::usage::StorageAccountant;
use std::sync::Arc;
use tracing::info;

/// The offline layer, wired around a single store handle.
///
/// Everything shares the same [`Store`]; it opens lazily on first use.
pub struct AppState {
    pub config: Config,
    pub store: Arc<Store>,
    pub client: Arc<dyn ContentClient>,
    pub resolver: Arc<CacheResolver>,
    pub downloader: Arc<DownloadOrchestrator>,
    pub accountant: Arc<StorageAccountant>,
    pub settings: Arc<dyn SettingsSource>,
}

impl AppState {
    /// Initialize application state against the HTTP content API
    pub fn new(config: Config) -> Result<Self> {
        let client = Arc::new(HttpContentClient::new(&config)?);
        let store = Store::new(config.database_path()).with_quota(config.quota_bytes);
        info!(path = ?config.database_path(), api = %config.api_base, "offline store configured");
        Ok(Self::assemble(config, store, client))
    }

    /// Wire the state around an arbitrary content client and store.
    pub fn with_client(config: Config, store: Store, client: Arc<dyn ContentClient>) -> Self {
        Self::assemble(config, store, client)
    }

    fn assemble(config: Config, store: Store, client: Arc<dyn ContentClient>) -> Self {
        let store = Arc::new(store);
        let settings: Arc<dyn SettingsSource> = Arc::new(StaticSettings::from(&config));
        let resolver = Arc::new(CacheResolver::new(Arc::clone(&store), Arc::clone(&client)));
        let accountant = Arc::new(StorageAccountant::new(Arc::clone(&store)));
        let downloader = Arc::new(DownloadOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&resolver),
            Arc::clone(&client),
            Arc::clone(&accountant),
            Arc::clone(&settings),
            config.download.clone(),
        ));

        Self {
            config,
            store,
            client,
            resolver,
            downloader,
            accountant,
            settings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DownloadOptions;
    use crate::mock::MockContentClient;
    use crate::quran::VerseKey;

    #[tokio::test]
    async fn test_components_share_one_store() {
        let config = Config {
            reciter: "husary".into(),
            download: DownloadOptions::unpaced(),
            ..Config::default()
        };
        let client = Arc::new(MockContentClient::new().with_chapter(1, 7, [1, 1]).with_page(
            1,
            (1..=7).map(|v| VerseKey::new(1, v)),
        ));
        let state = AppState::with_client(config, Store::in_memory(), client);
        assert_eq!(state.settings.reciter_id(), 6);

        let reciter = state.settings.reciter_id();
        state
            .downloader
            .download_audio(reciter, &[1], "en", &|_: &crate::downloader::DownloadProgress| {})
            .await;

        let audio = state.resolver.resolve_page_audio(1, reciter, "en").await;
        assert!(audio.iter().all(|entry| entry.source.is_local()));
        assert_eq!(state.store.stats().await.unwrap().audio_records, 7);
        assert!(state.accountant.usage().await.used_bytes > 0);
    }

    #[test]
    fn test_new_uses_configured_database() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let state = AppState::new(config).unwrap();
        assert_eq!(state.store.path(), Some(dir.path().join("offline.db").as_path()));
    }
}
