//! Bulk download jobs
//!
//! Fills the offline store with every page of text or with the recitations of
//! a set of chapters. Units are processed strictly one at a time. A failed
//! unit still advances progress, so every job ends `done` with
//! `current == total`; failures are only tallied in `failed`.

use crate::client::ContentClient;
use crate::config::{DownloadOptions, SettingsSource};
use crate::error::Result;
use crate::quran::{verse_count, Chapter, ChapterId, PageNumber, ReciterId, VerseKey, TOTAL_PAGES};
use crate::resolver::CacheResolver;
use crate::store::{AudioRecord, Store};
use crate::usage::{StorageAccountant, StorageUsage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DownloadMode {
    Text,
    Audio,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Pending,
    Running,
    Done,
}

/// Progress event emitted after each processed unit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadProgress {
    pub mode: DownloadMode,
    /// Units processed so far, successful or not
    pub current: u32,
    pub total: u32,
    /// What was processed last
    pub label: String,
    pub state: DownloadState,
    /// Units that could not be stored
    pub failed: u32,
}

impl DownloadProgress {
    fn new(mode: DownloadMode) -> Self {
        Self {
            mode,
            current: 0,
            total: 0,
            label: String::new(),
            state: DownloadState::Pending,
            failed: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == DownloadState::Done
    }
}

/// Receives progress events, synchronously, after each unit.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: &DownloadProgress);
}

impl<F> ProgressSink for F
where
    F: Fn(&DownloadProgress) + Send + Sync,
{
    fn on_progress(&self, progress: &DownloadProgress) {
        self(progress)
    }
}

impl ProgressSink for mpsc::UnboundedSender<DownloadProgress> {
    fn on_progress(&self, progress: &DownloadProgress) {
        // Receiver may be gone; the job carries on regardless
        let _ = self.send(progress.clone());
    }
}

/// Outcome of a finished job, with the refreshed completion snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadReport {
    pub progress: DownloadProgress,
    pub downloaded_chapters: BTreeSet<ChapterId>,
    pub usage: StorageUsage,
}

/// Progress bookkeeping for one running job.
struct Tracker<'a> {
    progress: DownloadProgress,
    sink: &'a dyn ProgressSink,
}

impl<'a> Tracker<'a> {
    fn new(mode: DownloadMode, sink: &'a dyn ProgressSink) -> Self {
        let tracker = Self {
            progress: DownloadProgress::new(mode),
            sink,
        };
        tracker.emit();
        tracker
    }

    fn emit(&self) {
        self.sink.on_progress(&self.progress);
    }

    fn start(&mut self, total: u32) {
        self.progress.total = total;
        self.progress.state = DownloadState::Running;
        self.emit();
    }

    /// Count `units` as processed, `failed` of them unsuccessfully.
    fn advance(&mut self, label: impl Into<String>, units: u32, failed: u32) {
        self.progress.current = (self.progress.current + units).min(self.progress.total);
        self.progress.failed += failed;
        self.progress.label = label.into();
        self.emit();
    }

    fn finish(mut self) -> DownloadProgress {
        self.progress.current = self.progress.total;
        self.progress.state = DownloadState::Done;
        self.emit();
        self.progress
    }
}

async fn pause(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}

pub struct DownloadOrchestrator {
    store: Arc<Store>,
    resolver: Arc<CacheResolver>,
    client: Arc<dyn ContentClient>,
    accountant: Arc<StorageAccountant>,
    settings: Arc<dyn SettingsSource>,
    options: DownloadOptions,
}

impl DownloadOrchestrator {
    pub fn new(
        store: Arc<Store>,
        resolver: Arc<CacheResolver>,
        client: Arc<dyn ContentClient>,
        accountant: Arc<StorageAccountant>,
        settings: Arc<dyn SettingsSource>,
        options: DownloadOptions,
    ) -> Self {
        Self {
            store,
            resolver,
            client,
            accountant,
            settings,
            options,
        }
    }

    // ============ Text ============

    /// Cache every page in `lang`, in page order.
    pub async fn download_text(&self, lang: &str, sink: &dyn ProgressSink) -> DownloadReport {
        let mut tracker = Tracker::new(DownloadMode::Text, sink);
        tracker.start(u32::from(TOTAL_PAGES));
        info!(lang, "starting text download");

        let batch = self.options.text_batch_size.max(1);
        for page in 1..=TOTAL_PAGES {
            let failed = match self.resolver.resolve_page(page, lang).await {
                Ok(_) => 0,
                Err(e) => {
                    warn!(page, lang, error = %e, "page download failed");
                    1
                }
            };
            tracker.advance(format!("Page {}", page), 1, failed);

            if page % batch == 0 {
                pause(self.options.text_batch_pause()).await;
            }
        }

        let progress = tracker.finish();
        info!(lang, failed = progress.failed, "text download finished");
        self.complete(progress, self.settings.reciter_id()).await
    }

    // ============ Audio ============

    /// Store the recitations of `chapters` for one reciter.
    ///
    /// Chapters already fully stored are left out. Partially stored chapters
    /// are resumed: their stored verses count as processed without touching
    /// the network. Each chapter's pages are cached in `lang` first. Without
    /// the chapter catalog every selected verse still counts toward the total
    /// and is tallied as failed.
    pub async fn download_audio(
        &self,
        reciter_id: ReciterId,
        chapters: &[ChapterId],
        lang: &str,
        sink: &dyn ProgressSink,
    ) -> DownloadReport {
        let mut tracker = Tracker::new(DownloadMode::Audio, sink);

        let catalog = match self.client.fetch_chapters().await {
            Ok(catalog) => Some(catalog),
            Err(e) => {
                error!(reciter_id, error = %e, "cannot fetch chapter catalog, selected verses will fail");
                None
            }
        };
        let find = |id: ChapterId| catalog.as_ref().and_then(|c| c.iter().find(|chapter| chapter.id == id));

        let selection: BTreeSet<ChapterId> = chapters.iter().copied().collect();
        let sized: Vec<(ChapterId, u16)> = selection
            .into_iter()
            .filter_map(|id| {
                let count = match &catalog {
                    Some(_) => find(id).map(|chapter| chapter.verses_count),
                    None => verse_count(id),
                };
                count.map(|count| (id, count))
            })
            .collect();

        let plan = self.plan_audio(reciter_id, sized).await;
        let total: u32 = plan.iter().map(|(_, count, _)| u32::from(*count)).sum();
        tracker.start(total);
        info!(reciter_id, chapters = plan.len(), total, "starting audio download");

        for (chapter_id, count, stored) in &plan {
            match find(*chapter_id) {
                Some(chapter) => self.download_chapter(reciter_id, chapter, stored, lang, &mut tracker).await,
                None => {
                    let remaining = usize::from(*count).saturating_sub(stored.len()) as u32;
                    tracker.advance(format!("Chapter {}", chapter_id), u32::from(*count), remaining);
                }
            }
        }

        let progress = tracker.finish();
        info!(reciter_id, failed = progress.failed, "audio download finished");
        self.complete(progress, reciter_id).await
    }

    /// Download the audio of every chapter that appears on one page.
    ///
    /// Fails only when the page itself cannot be resolved.
    pub async fn download_page_audio(
        &self,
        page_number: PageNumber,
        reciter_id: ReciterId,
        lang: &str,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadReport> {
        let page = self.resolver.resolve_page(page_number, lang).await?;
        let chapters: Vec<ChapterId> = page.chapter_ids().into_iter().collect();
        Ok(self.download_audio(reciter_id, &chapters, lang, sink).await)
    }

    /// Chapters (with their verse counts) still needing work, paired with the
    /// verses already stored.
    async fn plan_audio(
        &self,
        reciter_id: ReciterId,
        chapters: Vec<(ChapterId, u16)>,
    ) -> Vec<(ChapterId, u16, BTreeSet<VerseKey>)> {
        let downloaded = self.store.list_downloaded_chapters(reciter_id).await.unwrap_or_else(|e| {
            warn!(reciter_id, error = %e, "cannot read downloaded chapters, assuming none");
            BTreeSet::new()
        });

        let mut plan = Vec::new();
        for (chapter_id, count) in chapters {
            let stored = if downloaded.contains(&chapter_id) {
                self.store
                    .list_downloaded_verses(reciter_id, chapter_id)
                    .await
                    .unwrap_or_default()
            } else {
                BTreeSet::new()
            };

            if stored.len() >= usize::from(count) {
                debug!(reciter_id, chapter_id, "chapter already downloaded, skipping");
                continue;
            }
            plan.push((chapter_id, count, stored));
        }
        plan
    }

    async fn download_chapter(
        &self,
        reciter_id: ReciterId,
        chapter: &Chapter,
        stored: &BTreeSet<VerseKey>,
        lang: &str,
        tracker: &mut Tracker<'_>,
    ) {
        // Text for offline reading alongside the audio
        for page in chapter.page_range() {
            if let Err(e) = self.resolver.resolve_page(page, lang).await {
                debug!(page, error = %e, "page pre-cache failed");
            }
            pause(self.options.page_pause()).await;
        }

        let listing = match self.resolver.chapter_audio(reciter_id, chapter.id).await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(reciter_id, chapter_id = chapter.id, error = %e, "chapter audio listing failed");
                let remaining = usize::from(chapter.verses_count).saturating_sub(stored.len()) as u32;
                tracker.advance(chapter.name_simple.clone(), u32::from(chapter.verses_count), remaining);
                return;
            }
        };
        let urls: HashMap<VerseKey, &str> = listing.iter().map(|f| (f.verse_key, f.url.as_str())).collect();

        for verse in 1..=chapter.verses_count {
            let verse_key = VerseKey::new(chapter.id, verse);
            let label = format!("{} {}", chapter.name_simple, verse_key);
            if stored.contains(&verse_key) {
                tracker.advance(label, 1, 0);
                continue;
            }

            let failed = match urls.get(&verse_key) {
                Some(url) => match self.download_verse(reciter_id, verse_key, url).await {
                    Ok(()) => 0,
                    Err(e) => {
                        warn!(reciter_id, %verse_key, error = %e, "verse download failed");
                        1
                    }
                },
                None => {
                    warn!(reciter_id, %verse_key, "verse missing from chapter listing");
                    1
                }
            };
            tracker.advance(label, 1, failed);
            pause(self.options.verse_pause()).await;
        }
    }

    async fn download_verse(&self, reciter_id: ReciterId, verse_key: VerseKey, url: &str) -> Result<()> {
        let payload = self.client.fetch_binary(url).await?;
        self.store.put_audio(AudioRecord::new(reciter_id, verse_key, payload)).await
    }

    // ============ Maintenance ============

    /// Remove a chapter's stored audio. Nothing stored is not an error.
    pub async fn delete_chapter_audio(&self, reciter_id: ReciterId, chapter_id: ChapterId) -> Result<usize> {
        let removed = self.store.delete_chapter_audio(reciter_id, chapter_id).await?;
        info!(reciter_id, chapter_id, removed, "deleted chapter audio");
        Ok(removed)
    }

    pub async fn downloaded_chapters(&self, reciter_id: ReciterId) -> Result<BTreeSet<ChapterId>> {
        self.store.list_downloaded_chapters(reciter_id).await
    }

    async fn complete(&self, progress: DownloadProgress, reciter_id: ReciterId) -> DownloadReport {
        let downloaded_chapters = self.downloaded_chapters(reciter_id).await.unwrap_or_else(|e| {
            warn!(reciter_id, error = %e, "cannot refresh downloaded chapters");
            BTreeSet::new()
        });
        DownloadReport {
            progress,
            downloaded_chapters,
            usage: self.accountant.usage().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticSettings;
    use crate::mock::MockContentClient;
    use std::sync::Mutex;

    struct Harness {
        orchestrator: DownloadOrchestrator,
        store: Arc<Store>,
        client: Arc<MockContentClient>,
    }

    fn harness(client: MockContentClient) -> Harness {
        let store = Arc::new(Store::in_memory());
        let client = Arc::new(client);
        let resolver = Arc::new(CacheResolver::new(Arc::clone(&store), client.clone()));
        let orchestrator = DownloadOrchestrator::new(
            Arc::clone(&store),
            resolver,
            client.clone(),
            Arc::new(StorageAccountant::new(Arc::clone(&store))),
            Arc::new(StaticSettings::new(7, "en")),
            DownloadOptions::unpaced(),
        );
        Harness {
            orchestrator,
            store,
            client,
        }
    }

    fn chapters_fixture() -> MockContentClient {
        MockContentClient::new()
            .with_chapter(1, 7, [1, 1])
            .with_chapter(2, 5, [2, 3])
            .with_page(1, (1..=7).map(|v| VerseKey::new(1, v)))
            .with_page(2, (1..=3).map(|v| VerseKey::new(2, v)))
            .with_page(3, (4..=5).map(|v| VerseKey::new(2, v)))
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<DownloadProgress>>);

    impl ProgressSink for Recorder {
        fn on_progress(&self, progress: &DownloadProgress) {
            self.0.lock().unwrap().push(progress.clone());
        }
    }

    impl Recorder {
        fn events(&self) -> Vec<DownloadProgress> {
            self.0.lock().unwrap().clone()
        }
    }

    fn assert_monotonic(events: &[DownloadProgress]) {
        for pair in events.windows(2) {
            assert!(pair[1].current >= pair[0].current, "{:?}", pair);
            assert!(pair[1].current <= pair[1].total, "{:?}", pair[1]);
        }
    }

    #[tokio::test]
    async fn test_text_job_completes_despite_failed_page() {
        let h = harness(MockContentClient::new().with_synthetic_pages(TOTAL_PAGES).failing_page(350));
        let recorder = Recorder::default();

        let report = h.orchestrator.download_text("en", &recorder).await;

        assert_eq!(report.progress.total, 604);
        assert_eq!(report.progress.current, 604);
        assert_eq!(report.progress.failed, 1);
        assert!(report.progress.is_done());
        assert_eq!(h.client.page_calls(), 604);
        assert!(h.store.get_text_page(350, "en").await.unwrap().is_none());
        assert_eq!(h.store.stats().await.unwrap().text_pages, 603);

        let events = recorder.events();
        assert_eq!(events.first().unwrap().state, DownloadState::Pending);
        assert_eq!(events.last().unwrap().state, DownloadState::Done);
        assert_eq!(events.len(), 604 + 3);
        assert_monotonic(&events);
    }

    #[tokio::test]
    async fn test_text_job_retry_only_fetches_missing_pages() {
        let h = harness(MockContentClient::new().with_synthetic_pages(TOTAL_PAGES).failing_page(350));
        h.orchestrator.download_text("en", &|_: &DownloadProgress| {}).await;

        let report = h.orchestrator.download_text("en", &|_: &DownloadProgress| {}).await;
        assert_eq!(h.client.page_calls(), 605);
        assert_eq!(report.progress.current, 604);
    }

    #[tokio::test]
    async fn test_text_job_completes_under_total_failure() {
        let h = harness(MockContentClient::new());
        h.client.set_offline(true);

        let report = h.orchestrator.download_text("en", &|_: &DownloadProgress| {}).await;

        assert_eq!(report.progress.current, 604);
        assert_eq!(report.progress.failed, 604);
        assert!(report.progress.is_done());
    }

    #[tokio::test]
    async fn test_audio_job_stores_every_verse() {
        let h = harness(chapters_fixture());
        let recorder = Recorder::default();

        let report = h.orchestrator.download_audio(7, &[2, 1], "en", &recorder).await;

        assert_eq!(report.progress.total, 12);
        assert_eq!(report.progress.current, 12);
        assert_eq!(report.progress.failed, 0);
        assert_eq!(report.downloaded_chapters, BTreeSet::from([1, 2]));
        assert!(report.usage.used_bytes > 0);
        assert_eq!(h.client.chapter_audio_calls(), 2);
        assert_eq!(h.client.binary_calls(), 12);
        assert_eq!(
            h.store.get_audio(7, VerseKey::new(2, 5)).await.unwrap(),
            Some(MockContentClient::audio_payload(7, VerseKey::new(2, 5)))
        );

        // Pages spanning both chapters were cached for offline reading
        for page in 1..=3 {
            assert!(h.store.get_text_page(page, "en").await.unwrap().is_some());
        }

        let events = recorder.events();
        assert_monotonic(&events);
        assert_eq!(events.last().unwrap().label, "Chapter 2 2:5");
    }

    #[tokio::test]
    async fn test_audio_job_skips_fully_downloaded_chapters() {
        let h = harness(chapters_fixture());
        h.orchestrator.download_audio(7, &[1], "en", &|_: &DownloadProgress| {}).await;
        let binary_calls = h.client.binary_calls();

        let report = h.orchestrator.download_audio(7, &[1, 2], "en", &|_: &DownloadProgress| {}).await;

        assert_eq!(report.progress.total, 5);
        assert_eq!(h.client.binary_calls(), binary_calls + 5);
        assert_eq!(report.downloaded_chapters, BTreeSet::from([1, 2]));
    }

    #[tokio::test]
    async fn test_audio_job_retry_only_refetches_gaps() {
        let h = harness(chapters_fixture());
        let gap = MockContentClient::audio_url(7, VerseKey::new(1, 3));
        h.client.fail_url(gap.clone());

        let first = h.orchestrator.download_audio(7, &[1], "en", &|_: &DownloadProgress| {}).await;
        assert_eq!(first.progress.current, 7);
        assert_eq!(first.progress.failed, 1);
        assert!(first.downloaded_chapters.contains(&1));
        assert_eq!(h.client.binary_calls(), 7);

        h.client.restore_url(&gap);
        let second = h.orchestrator.download_audio(7, &[1], "en", &|_: &DownloadProgress| {}).await;
        assert_eq!(second.progress.total, 7);
        assert_eq!(second.progress.current, 7);
        assert_eq!(second.progress.failed, 0);
        assert_eq!(h.client.binary_calls(), 8);
        assert!(h.store.has_audio(7, VerseKey::new(1, 3)).await.unwrap());
    }

    #[tokio::test]
    async fn test_audio_job_counts_failed_listing_toward_total() {
        let h = harness(chapters_fixture().failing_chapter_audio(1));

        let report = h.orchestrator.download_audio(7, &[1, 2], "en", &|_: &DownloadProgress| {}).await;

        assert_eq!(report.progress.current, 12);
        assert_eq!(report.progress.failed, 7);
        assert_eq!(report.downloaded_chapters, BTreeSet::from([2]));
    }

    #[tokio::test]
    async fn test_audio_job_completes_under_total_failure() {
        let h = harness(chapters_fixture());
        // Catalog succeeds, every later call fails
        let catalog = h.client.fetch_chapters().await.unwrap();
        assert_eq!(catalog.len(), 2);
        for chapter in &catalog {
            for verse in 1..=chapter.verses_count {
                h.client.fail_url(MockContentClient::audio_url(7, VerseKey::new(chapter.id, verse)));
            }
        }

        let report = h.orchestrator.download_audio(7, &[1, 2], "en", &|_: &DownloadProgress| {}).await;
        assert_eq!(report.progress.current, report.progress.total);
        assert_eq!(report.progress.failed, 12);
        assert!(report.downloaded_chapters.is_empty());

        h.client.set_offline(true);
        let offline = h.orchestrator.download_audio(7, &[1, 2], "en", &|_: &DownloadProgress| {}).await;
        // Verse counts come from the built-in table once the catalog is unreachable
        assert!(offline.progress.is_done());
        assert_eq!(offline.progress.total, 7 + 286);
        assert_eq!(offline.progress.current, 7 + 286);
        assert_eq!(offline.progress.failed, 7 + 286);
    }

    #[tokio::test]
    async fn test_audio_job_offline_counts_selection_as_failed() {
        let h = harness(chapters_fixture());
        h.client.set_offline(true);
        let recorder = Recorder::default();

        let report = h.orchestrator.download_audio(7, &[1, 2, 200], "en", &recorder).await;

        let expected = u32::from(verse_count(1).unwrap() + verse_count(2).unwrap());
        assert_eq!(report.progress.total, expected);
        assert_eq!(report.progress.current, expected);
        assert_eq!(report.progress.failed, expected);
        assert!(report.progress.is_done());
        assert_monotonic(&recorder.events());
    }

    #[tokio::test]
    async fn test_audio_job_offline_skips_stored_chapters() {
        let h = harness(chapters_fixture());
        h.orchestrator.download_audio(7, &[1], "en", &|_: &DownloadProgress| {}).await;
        h.client.set_offline(true);

        let report = h.orchestrator.download_audio(7, &[1, 2], "en", &|_: &DownloadProgress| {}).await;

        assert_eq!(report.progress.total, u32::from(verse_count(2).unwrap()));
        assert_eq!(report.progress.failed, report.progress.total);
        assert_eq!(report.downloaded_chapters, BTreeSet::from([1]));
    }

    #[tokio::test]
    async fn test_page_audio_download_covers_page_chapters() {
        let h = harness(chapters_fixture());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let report = h.orchestrator.download_page_audio(3, 7, "en", &tx).await.unwrap();

        assert_eq!(report.progress.total, 5);
        assert_eq!(report.downloaded_chapters, BTreeSet::from([2]));

        let mut states = Vec::new();
        while let Ok(progress) = rx.try_recv() {
            states.push(progress.state);
        }
        assert_eq!(states.first(), Some(&DownloadState::Pending));
        assert_eq!(states.last(), Some(&DownloadState::Done));
    }

    #[tokio::test]
    async fn test_page_audio_download_fails_for_unreachable_page() {
        let h = harness(chapters_fixture());
        h.client.set_offline(true);
        let result = h.orchestrator.download_page_audio(1, 7, "en", &|_: &DownloadProgress| {}).await;
        assert!(result.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_delete_chapter_audio() {
        let h = harness(chapters_fixture());
        assert_eq!(h.orchestrator.delete_chapter_audio(7, 114).await.unwrap(), 0);

        h.orchestrator.download_audio(7, &[1, 2], "en", &|_: &DownloadProgress| {}).await;
        assert_eq!(h.orchestrator.delete_chapter_audio(7, 1).await.unwrap(), 7);
        assert_eq!(h.orchestrator.downloaded_chapters(7).await.unwrap(), BTreeSet::from([2]));
    }

    #[test]
    fn test_progress_serializes_snake_case() {
        let progress = DownloadProgress::new(DownloadMode::Audio);
        let json = serde_json::to_value(&progress).unwrap();
        assert_eq!(json["mode"], "audio");
        assert_eq!(json["state"], "pending");
    }
}
