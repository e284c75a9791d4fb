//! In-memory content client for testing.

use crate::client::ContentClient;
use crate::error::{MaktabError, Result};
use crate::quran::{
    AudioFile, Chapter, ChapterId, PageChapter, PageNumber, QuranPage, ReciterId, Verse, VerseKey,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Scripted [`ContentClient`] with per-endpoint call accounting.
///
/// Chapters and pages are registered up front; every registered chapter gets
/// an audio listing for any reciter, and every listed URL resolves to a small
/// payload naming its reciter and verse. Individual pages, chapters or URLs
/// can be told to fail, or the whole client can be taken offline.
#[derive(Default)]
pub struct MockContentClient {
    chapters: BTreeMap<ChapterId, Chapter>,
    pages: BTreeMap<PageNumber, Vec<VerseKey>>,
    failing_pages: HashSet<PageNumber>,
    failing_chapters: HashSet<ChapterId>,
    failing_urls: Mutex<HashSet<String>>,
    offline: AtomicBool,
    page_calls: AtomicUsize,
    chapter_audio_calls: AtomicUsize,
    binary_calls: AtomicUsize,
    fetched_pages: Mutex<Vec<(PageNumber, String)>>,
}

impl MockContentClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a chapter spanning `pages` with `verses` verses.
    pub fn with_chapter(mut self, id: ChapterId, verses: u16, pages: [PageNumber; 2]) -> Self {
        self.chapters.insert(
            id,
            Chapter {
                id,
                revelation_place: "makkah".to_string(),
                revelation_order: id,
                bismillah_pre: id != 1 && id != 9,
                name_simple: format!("Chapter {}", id),
                name_complex: format!("Chapter {}", id),
                name_arabic: format!("سورة {}", id),
                verses_count: verses,
                pages,
                translated_name: None,
            },
        );
        self
    }

    /// Register the verses printed on a page, in page order.
    pub fn with_page(mut self, page: PageNumber, verses: impl IntoIterator<Item = VerseKey>) -> Self {
        self.pages.insert(page, verses.into_iter().collect());
        self
    }

    /// Serve every page from 1 to `last` with a single synthetic verse, unless
    /// already registered.
    pub fn with_synthetic_pages(mut self, last: PageNumber) -> Self {
        for page in 1..=last {
            self.pages
                .entry(page)
                .or_insert_with(|| vec![VerseKey::new(1 + (page % 114), 1)]);
        }
        self
    }

    pub fn failing_page(mut self, page: PageNumber) -> Self {
        self.failing_pages.insert(page);
        self
    }

    pub fn failing_chapter_audio(mut self, chapter: ChapterId) -> Self {
        self.failing_chapters.insert(chapter);
        self
    }

    pub fn fail_url(&self, url: impl Into<String>) {
        if let Ok(mut urls) = self.failing_urls.lock() {
            urls.insert(url.into());
        }
    }

    pub fn restore_url(&self, url: &str) {
        if let Ok(mut urls) = self.failing_urls.lock() {
            urls.remove(url);
        }
    }

    /// Make every subsequent call fail with a network error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    pub fn chapter_audio_calls(&self) -> usize {
        self.chapter_audio_calls.load(Ordering::SeqCst)
    }

    pub fn binary_calls(&self) -> usize {
        self.binary_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.page_calls() + self.chapter_audio_calls() + self.binary_calls()
    }

    /// Every (page, language) requested so far, in call order.
    pub fn fetched_pages(&self) -> Vec<(PageNumber, String)> {
        self.fetched_pages.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn audio_url(reciter_id: ReciterId, verse_key: VerseKey) -> String {
        format!("https://audio.test/{}/{:03}{:03}.mp3", reciter_id, verse_key.chapter, verse_key.verse)
    }

    pub fn audio_payload(reciter_id: ReciterId, verse_key: VerseKey) -> Vec<u8> {
        format!("recitation {} {}", reciter_id, verse_key).into_bytes()
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(MaktabError::Network("mock client is offline".to_string()));
        }
        Ok(())
    }

    fn verse(key: VerseKey, page: PageNumber, lang: &str) -> Verse {
        Verse {
            id: u32::from(key.chapter) * 1000 + u32::from(key.verse),
            verse_number: key.verse,
            verse_key: key,
            page_number: page,
            juz_number: 1,
            hizb_number: 1,
            text_qpc_hafs: Some(format!("text {}", key)),
            translations: vec![crate::quran::Translation {
                id: 1,
                text: format!("{} translation of {}", lang, key),
                resource_id: crate::quran::translation_id(lang),
                resource_name: None,
            }],
            words: vec![],
        }
    }
}

#[async_trait]
impl ContentClient for MockContentClient {
    async fn fetch_chapters(&self) -> Result<Vec<Chapter>> {
        self.check_online()?;
        Ok(self.chapters.values().cloned().collect())
    }

    async fn fetch_chapter(&self, chapter_id: ChapterId) -> Result<Chapter> {
        self.check_online()?;
        self.chapters
            .get(&chapter_id)
            .cloned()
            .ok_or_else(|| MaktabError::NotFound(format!("chapter {}", chapter_id)))
    }

    async fn fetch_page(&self, page_number: PageNumber, lang: &str) -> Result<QuranPage> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut fetched) = self.fetched_pages.lock() {
            fetched.push((page_number, lang.to_string()));
        }
        self.check_online()?;
        if self.failing_pages.contains(&page_number) {
            return Err(MaktabError::Network(format!("page {} unavailable", page_number)));
        }
        let keys = self
            .pages
            .get(&page_number)
            .ok_or_else(|| MaktabError::Network(format!("page {} unknown", page_number)))?;

        let verses = keys.iter().map(|&k| Self::verse(k, page_number, lang)).collect::<Vec<_>>();
        let mut chapter_ids: Vec<ChapterId> = keys.iter().map(|k| k.chapter).collect();
        chapter_ids.dedup();
        let chapters = chapter_ids
            .into_iter()
            .map(|id| PageChapter {
                id,
                name: format!("Chapter {}", id),
                name_arabic: format!("سورة {}", id),
            })
            .collect();

        Ok(QuranPage::new(page_number, verses, chapters))
    }

    async fn fetch_chapter_audio(&self, reciter_id: ReciterId, chapter_id: ChapterId) -> Result<Vec<AudioFile>> {
        self.chapter_audio_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        if self.failing_chapters.contains(&chapter_id) {
            return Err(MaktabError::Network(format!("chapter {} listing unavailable", chapter_id)));
        }
        let chapter = self
            .chapters
            .get(&chapter_id)
            .ok_or_else(|| MaktabError::Network(format!("chapter {} unknown", chapter_id)))?;

        Ok((1..=chapter.verses_count)
            .map(|verse| {
                let verse_key = VerseKey::new(chapter_id, verse);
                AudioFile {
                    verse_key,
                    url: Self::audio_url(reciter_id, verse_key),
                }
            })
            .collect())
    }

    async fn fetch_binary(&self, url: &str) -> Result<Vec<u8>> {
        self.binary_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let failing = self.failing_urls.lock().map(|u| u.contains(url)).unwrap_or(false);
        if failing {
            return Err(MaktabError::Network(format!("{} unavailable", url)));
        }

        // https://audio.test/{reciter}/{ccc}{vvv}.mp3
        let parse = || -> Option<(ReciterId, VerseKey)> {
            let rest = url.strip_prefix("https://audio.test/")?;
            let (reciter, file) = rest.split_once('/')?;
            let stem = file.strip_suffix(".mp3")?;
            if stem.len() != 6 {
                return None;
            }
            let chapter = stem[..3].parse().ok()?;
            let verse = stem[3..].parse().ok()?;
            Some((reciter.parse().ok()?, VerseKey::new(chapter, verse)))
        };

        parse()
            .map(|(reciter, key)| Self::audio_payload(reciter, key))
            .ok_or_else(|| MaktabError::Network(format!("{} not found", url)))
    }
}
