//! Cache resolver: serve pages and recitations from the offline store first,
//! falling back to the network with write-through.

use crate::client::ContentClient;
use crate::error::{MaktabError, Result};
use crate::quran::{is_valid_page, AudioFile, ChapterId, PageNumber, QuranPage, ReciterId, VerseKey, TOTAL_PAGES};
use crate::store::{Store, TextPageRecord};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// A playable in-memory recitation payload.
///
/// Cheap to clone. The resolver keeps no reference to it; whoever displays
/// the audio owns the handle and drops it when the page goes away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioHandle(Arc<[u8]>);

impl AudioHandle {
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for AudioHandle {
    fn from(payload: Vec<u8>) -> Self {
        Self(payload.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSource {
    /// Served from the offline store.
    Local(AudioHandle),
    /// Streamable URL from the chapter listing.
    Remote(String),
}

impl AudioSource {
    pub fn is_local(&self) -> bool {
        matches!(self, AudioSource::Local(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageAudio {
    pub verse_key: VerseKey,
    pub source: AudioSource,
}

/// How a page's audio was resolved, for display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PageAudioSummary {
    pub local: usize,
    pub remote: usize,
}

impl PageAudioSummary {
    pub fn of(entries: &[PageAudio]) -> Self {
        let local = entries.iter().filter(|e| e.source.is_local()).count();
        Self {
            local,
            remote: entries.len() - local,
        }
    }
}

type ListingKey = (ReciterId, ChapterId);

pub struct CacheResolver {
    store: Arc<Store>,
    client: Arc<dyn ContentClient>,
    /// Chapter audio listings fetched this session.
    ///
    /// Never invalidated and never bounded: a session that browses many
    /// reciters keeps every listing it has seen. The lock is never held
    /// across an await.
    chapter_audio: Mutex<HashMap<ListingKey, Arc<Vec<AudioFile>>>>,
}

impl CacheResolver {
    pub fn new(store: Arc<Store>, client: Arc<dyn ContentClient>) -> Self {
        Self {
            store,
            client,
            chapter_audio: Mutex::new(HashMap::new()),
        }
    }

    // ============ Text ============

    /// Page text in one translation language.
    ///
    /// Store errors on the read path are treated as a miss. A failed
    /// write-through is logged and the fetched page is still returned. Only a
    /// network failure on a miss reaches the caller.
    pub async fn resolve_page(&self, page_number: PageNumber, lang: &str) -> Result<QuranPage> {
        if !is_valid_page(page_number) {
            return Err(MaktabError::NotFound(format!("page {}", page_number)));
        }

        match self.store.get_text_page(page_number, lang).await {
            Ok(Some(page)) => {
                debug!(page_number, lang, "text page served from store");
                return Ok(page);
            }
            Ok(None) => {}
            Err(e) => warn!(page_number, lang, error = %e, "text page read failed, falling back to network"),
        }

        let page = self.client.fetch_page(page_number, lang).await?;

        if let Err(e) = self.store.put_text_page(TextPageRecord::new(lang, page.clone())).await {
            warn!(page_number, lang, error = %e, "failed to cache text page");
        }

        Ok(page)
    }

    /// Warm the store with the pages either side of `page_number`.
    pub async fn prefetch_neighbors(&self, page_number: PageNumber, lang: &str) {
        let neighbors = [page_number.checked_sub(1), page_number.checked_add(1)];
        for neighbor in neighbors.into_iter().flatten().filter(|&p| p >= 1 && p <= TOTAL_PAGES) {
            if let Err(e) = self.resolve_page(neighbor, lang).await {
                debug!(page_number = neighbor, error = %e, "neighbor prefetch failed");
            }
        }
    }

    // ============ Audio ============

    /// Recitations for every verse on a page, in page order.
    ///
    /// Stored verses resolve locally. The rest are looked up in their
    /// chapter's listing, one listing per distinct chapter. A chapter whose
    /// listing cannot be fetched is left out; an unresolvable page yields an
    /// empty result.
    pub async fn resolve_page_audio(&self, page_number: PageNumber, reciter_id: ReciterId, lang: &str) -> Vec<PageAudio> {
        let page = match self.resolve_page(page_number, lang).await {
            Ok(page) => page,
            Err(e) => {
                warn!(page_number, error = %e, "cannot resolve page audio without its verses");
                return Vec::new();
            }
        };
        let keys = page.verse_keys();

        let mut local: HashMap<VerseKey, AudioHandle> = HashMap::new();
        let mut missing: BTreeMap<ChapterId, Vec<VerseKey>> = BTreeMap::new();
        for &key in &keys {
            match self.store.get_audio(reciter_id, key).await {
                Ok(Some(payload)) => {
                    local.insert(key, payload.into());
                }
                Ok(None) => missing.entry(key.chapter).or_default().push(key),
                Err(e) => {
                    warn!(reciter_id, verse_key = %key, error = %e, "audio read failed, treating as missing");
                    missing.entry(key.chapter).or_default().push(key);
                }
            }
        }

        let mut remote: HashMap<VerseKey, String> = HashMap::new();
        for (chapter_id, wanted) in missing {
            let listing = match self.chapter_audio(reciter_id, chapter_id).await {
                Ok(listing) => listing,
                Err(e) => {
                    warn!(reciter_id, chapter_id, error = %e, "chapter audio listing unavailable");
                    continue;
                }
            };
            remote.extend(
                listing
                    .iter()
                    .filter(|file| wanted.contains(&file.verse_key))
                    .map(|file| (file.verse_key, file.url.clone())),
            );
        }

        debug!(page_number, reciter_id, local = local.len(), remote = remote.len(), "resolved page audio");

        keys.into_iter()
            .filter_map(|verse_key| {
                let source = match local.remove(&verse_key) {
                    Some(handle) => AudioSource::Local(handle),
                    None => AudioSource::Remote(remote.remove(&verse_key)?),
                };
                Some(PageAudio { verse_key, source })
            })
            .collect()
    }

    /// A chapter's audio listing, fetched at most once per session.
    pub async fn chapter_audio(&self, reciter_id: ReciterId, chapter_id: ChapterId) -> Result<Arc<Vec<AudioFile>>> {
        if let Some(listing) = self.memoized(&(reciter_id, chapter_id)) {
            debug!(reciter_id, chapter_id, "chapter audio listing served from memo");
            return Ok(listing);
        }

        let listing = Arc::new(self.client.fetch_chapter_audio(reciter_id, chapter_id).await?);
        if let Ok(mut memo) = self.chapter_audio.lock() {
            memo.insert((reciter_id, chapter_id), Arc::clone(&listing));
        }
        Ok(listing)
    }

    fn memoized(&self, key: &ListingKey) -> Option<Arc<Vec<AudioFile>>> {
        self.chapter_audio.lock().ok()?.get(key).cloned()
    }

    /// Number of chapter listings held in the session memo.
    pub fn memoized_listings(&self) -> usize {
        self.chapter_audio.lock().map(|memo| memo.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockContentClient;
    use crate::store::AudioRecord;

    fn fixture() -> MockContentClient {
        MockContentClient::new()
            .with_chapter(1, 7, [1, 1])
            .with_chapter(2, 286, [2, 49])
            .with_chapter(3, 200, [50, 76])
            .with_page(1, (1..=7).map(|v| VerseKey::new(1, v)))
            .with_page(2, (1..=5).map(|v| VerseKey::new(2, v)))
            .with_page(
                49,
                [VerseKey::new(2, 285), VerseKey::new(2, 286), VerseKey::new(3, 1), VerseKey::new(3, 2)],
            )
    }

    fn resolver(client: MockContentClient) -> (CacheResolver, Arc<Store>, Arc<MockContentClient>) {
        let store = Arc::new(Store::in_memory());
        let client = Arc::new(client);
        let resolver = CacheResolver::new(Arc::clone(&store), client.clone());
        (resolver, store, client)
    }

    #[tokio::test]
    async fn test_first_audio_resolve_issues_one_listing_call() {
        let (resolver, _store, client) = resolver(fixture());

        let entries = resolver.resolve_page_audio(1, 7, "en").await;

        assert_eq!(client.chapter_audio_calls(), 1);
        assert_eq!(entries.len(), 7);
        let keys: Vec<_> = entries.iter().map(|e| e.verse_key).collect();
        assert_eq!(keys, (1..=7).map(|v| VerseKey::new(1, v)).collect::<Vec<_>>());
        assert!(entries.iter().all(|e| !e.source.is_local()));
        assert_eq!(
            entries[0].source,
            AudioSource::Remote(MockContentClient::audio_url(7, VerseKey::new(1, 1)))
        );
    }

    #[tokio::test]
    async fn test_repeat_resolve_uses_memo_then_store() {
        let (resolver, store, client) = resolver(fixture());
        resolver.resolve_page_audio(1, 7, "en").await;

        let again = resolver.resolve_page_audio(1, 7, "en").await;
        assert_eq!(again.len(), 7);
        assert_eq!(client.chapter_audio_calls(), 1);
        assert_eq!(resolver.memoized_listings(), 1);

        for verse in 1..=7 {
            let key = VerseKey::new(1, verse);
            store
                .put_audio(AudioRecord::new(7, key, MockContentClient::audio_payload(7, key)))
                .await
                .unwrap();
        }
        let calls_before = client.total_calls();

        let local = resolver.resolve_page_audio(1, 7, "en").await;
        assert_eq!(client.total_calls(), calls_before);
        assert_eq!(PageAudioSummary::of(&local), PageAudioSummary { local: 7, remote: 0 });
        match &local[6].source {
            AudioSource::Local(handle) => {
                assert_eq!(handle.bytes(), MockContentClient::audio_payload(7, VerseKey::new(1, 7)).as_slice())
            }
            other => panic!("expected local audio, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mixed_local_and_remote_keep_page_order() {
        let (resolver, store, client) = resolver(fixture());
        store
            .put_audio(AudioRecord::new(7, VerseKey::new(2, 3), b"stored".to_vec()))
            .await
            .unwrap();

        let entries = resolver.resolve_page_audio(2, 7, "en").await;
        let keys: Vec<_> = entries.iter().map(|e| e.verse_key.verse).collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
        assert!(entries[2].source.is_local());
        assert_eq!(PageAudioSummary::of(&entries), PageAudioSummary { local: 1, remote: 4 });
        assert_eq!(client.chapter_audio_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_chapter_listing_only_drops_that_chapter() {
        let (resolver, _store, client) = resolver(fixture().failing_chapter_audio(3));

        let entries = resolver.resolve_page_audio(49, 7, "en").await;

        assert_eq!(client.chapter_audio_calls(), 2);
        let keys: Vec<_> = entries.iter().map(|e| e.verse_key).collect();
        assert_eq!(keys, vec![VerseKey::new(2, 285), VerseKey::new(2, 286)]);
        assert_eq!(resolver.memoized_listings(), 1);
    }

    #[tokio::test]
    async fn test_listings_memoized_per_reciter() {
        let (resolver, _store, client) = resolver(fixture());
        resolver.resolve_page_audio(1, 7, "en").await;
        resolver.resolve_page_audio(1, 2, "en").await;
        assert_eq!(client.chapter_audio_calls(), 2);
    }

    #[tokio::test]
    async fn test_page_audio_degrades_to_empty_when_offline() {
        let (resolver, _store, client) = resolver(fixture());
        client.set_offline(true);
        assert!(resolver.resolve_page_audio(1, 7, "en").await.is_empty());
    }

    #[tokio::test]
    async fn test_text_page_written_through_and_served_from_store() {
        let (resolver, store, client) = resolver(fixture());

        let fetched = resolver.resolve_page(1, "en").await.unwrap();
        assert_eq!(fetched.verses.len(), 7);
        assert_eq!(store.get_text_page(1, "en").await.unwrap(), Some(fetched.clone()));

        client.set_offline(true);
        assert_eq!(resolver.resolve_page(1, "en").await.unwrap(), fetched);
        assert_eq!(client.page_calls(), 1);
    }

    #[tokio::test]
    async fn test_text_page_languages_are_separate_entries() {
        let (resolver, _store, client) = resolver(fixture());
        let en = resolver.resolve_page(1, "en").await.unwrap();
        let ha = resolver.resolve_page(1, "ha").await.unwrap();

        assert_ne!(en.verses[0].translations, ha.verses[0].translations);
        assert_eq!(client.fetched_pages(), vec![(1, "en".to_string()), (1, "ha".to_string())]);
    }

    #[tokio::test]
    async fn test_interactive_page_failure_is_retryable() {
        let (resolver, _store, client) = resolver(fixture());
        client.set_offline(true);

        let err = resolver.resolve_page(2, "en").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_out_of_range_page_is_not_found() {
        let (resolver, _store, client) = resolver(fixture());
        assert!(matches!(resolver.resolve_page(0, "en").await, Err(MaktabError::NotFound(_))));
        assert!(matches!(resolver.resolve_page(605, "en").await, Err(MaktabError::NotFound(_))));
        assert_eq!(client.page_calls(), 0);
    }

    #[tokio::test]
    async fn test_unopenable_store_still_serves_from_network() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path()));
        assert!(matches!(store.open().await, Err(MaktabError::Open(_))));
        let client = Arc::new(fixture());
        let resolver = CacheResolver::new(store, client.clone());

        let page = resolver.resolve_page(1, "en").await.unwrap();
        assert_eq!(page.verses.len(), 7);

        let entries = resolver.resolve_page_audio(1, 7, "en").await;
        assert_eq!(entries.len(), 7);
        assert!(entries.iter().all(|e| !e.source.is_local()));
        assert_eq!(client.chapter_audio_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_through_still_returns_page() {
        let client = Arc::new(fixture().with_page(10, (1..=120).map(|v| VerseKey::new(2, v))));
        // The cap freezes the database at its current size
        let store = Arc::new(Store::in_memory().with_quota(Some(1)));
        let resolver = CacheResolver::new(Arc::clone(&store), client.clone());

        let page = resolver.resolve_page(10, "en").await.unwrap();
        assert_eq!(page.verses.len(), 120);
        assert!(matches!(
            store.put_text_page(TextPageRecord::new("en", page.clone())).await,
            Err(MaktabError::QuotaExceeded(_))
        ));
        assert_eq!(store.get_text_page(10, "en").await.unwrap(), None);

        // Nothing was cached, so the next view goes back to the network
        assert_eq!(resolver.resolve_page(10, "en").await.unwrap(), page);
        assert_eq!(client.page_calls(), 2);
    }

    #[tokio::test]
    async fn test_prefetch_neighbors() {
        let (resolver, store, client) = resolver(fixture());

        resolver.prefetch_neighbors(1, "en").await;
        assert_eq!(client.fetched_pages(), vec![(2, "en".to_string())]);
        assert!(store.get_text_page(2, "en").await.unwrap().is_some());

        // Page 50 is not scripted, so its fetch fails quietly
        resolver.prefetch_neighbors(49, "en").await;
        assert!(store.get_text_page(48, "en").await.unwrap().is_none());
        assert!(store.get_text_page(50, "en").await.unwrap().is_none());
    }
}
