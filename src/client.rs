//! Network content client
//!
//! The offline layer talks to the content API only through [`ContentClient`].
//! [`HttpContentClient`] implements it against the Quran.com v4 REST contract.

use crate::config::Config;
use crate::error::{MaktabError, Result};
use crate::quran::{
    translation_id, AudioFile, Chapter, ChapterId, PageChapter, PageNumber, QuranPage, ReciterId, Verse,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeSet;
use tokio::sync::OnceCell;
use tracing::debug;

/// Enough for the longest chapter (Al-Baqarah, 286 verses) in one listing.
const AUDIO_LISTING_PAGE_SIZE: u16 = 300;

/// Remote source of chapters, pages and recitation audio.
///
/// Every call is fallible and may be slow; implementations do not retry.
#[async_trait]
pub trait ContentClient: Send + Sync {
    /// All 114 chapters in order.
    async fn fetch_chapters(&self) -> Result<Vec<Chapter>>;

    async fn fetch_chapter(&self, chapter_id: ChapterId) -> Result<Chapter>;

    /// Verses of one page with words and the translation for `lang`.
    async fn fetch_page(&self, page_number: PageNumber, lang: &str) -> Result<QuranPage>;

    /// Complete audio listing of one chapter for one reciter, with absolute URLs.
    async fn fetch_chapter_audio(&self, reciter_id: ReciterId, chapter_id: ChapterId) -> Result<Vec<AudioFile>>;

    /// Raw bytes of an arbitrary resource.
    async fn fetch_binary(&self, url: &str) -> Result<Vec<u8>>;
}

#[derive(Deserialize)]
struct ChaptersResponse {
    chapters: Vec<Chapter>,
}

#[derive(Deserialize)]
struct VersesResponse {
    verses: Vec<Verse>,
}

#[derive(Deserialize)]
struct AudioFilesResponse {
    #[serde(default)]
    audio_files: Vec<AudioFile>,
}

pub struct HttpContentClient {
    client: reqwest::Client,
    api_base: String,
    audio_cdn: String,
    chapters: OnceCell<Vec<Chapter>>,
}

impl HttpContentClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            audio_cdn: config.audio_cdn.clone(),
            chapters: OnceCell::new(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}/{}", self.api_base, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| MaktabError::Network(format!("Failed to fetch {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(MaktabError::Network(format!(
                "Failed to fetch {}: HTTP {}",
                url,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| MaktabError::Network(format!("Failed to parse {}: {}", url, e)))
    }

    /// Chapter catalog, fetched once per client.
    async fn chapter_catalog(&self) -> Result<&[Chapter]> {
        let chapters = self
            .chapters
            .get_or_try_init(|| async {
                let response: ChaptersResponse = self.get_json("chapters").await?;
                debug!(count = response.chapters.len(), "fetched chapter catalog");
                Ok::<_, MaktabError>(response.chapters)
            })
            .await?;
        Ok(chapters.as_slice())
    }

    fn audio_url(&self, url: &str) -> String {
        absolute_audio_url(&self.audio_cdn, url)
    }
}

/// Listing URLs come relative to the audio CDN, occasionally protocol-relative.
pub(crate) fn absolute_audio_url(cdn: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else if let Some(rest) = url.strip_prefix("//") {
        format!("https://{}", rest)
    } else {
        format!("{}/{}", cdn.trim_end_matches('/'), url.trim_start_matches('/'))
    }
}

#[async_trait]
impl ContentClient for HttpContentClient {
    async fn fetch_chapters(&self) -> Result<Vec<Chapter>> {
        Ok(self.chapter_catalog().await?.to_vec())
    }

    async fn fetch_chapter(&self, chapter_id: ChapterId) -> Result<Chapter> {
        self.chapter_catalog()
            .await?
            .iter()
            .find(|c| c.id == chapter_id)
            .cloned()
            .ok_or_else(|| MaktabError::NotFound(format!("chapter {}", chapter_id)))
    }

    async fn fetch_page(&self, page_number: PageNumber, lang: &str) -> Result<QuranPage> {
        let path = format!(
            "verses/by_page/{}?words=true&translations={}&fields=text_qpc_hafs&word_fields=text_qpc_hafs,line_number",
            page_number,
            translation_id(lang)
        );
        let response: VersesResponse = self.get_json(&path).await?;

        let chapter_ids: BTreeSet<ChapterId> = response.verses.iter().map(|v| v.verse_key.chapter).collect();
        let mut chapters = Vec::with_capacity(chapter_ids.len());
        for id in chapter_ids {
            let chapter = self.fetch_chapter(id).await?;
            chapters.push(PageChapter {
                id: chapter.id,
                name: chapter.name_simple,
                name_arabic: chapter.name_arabic,
            });
        }

        Ok(QuranPage::new(page_number, response.verses, chapters))
    }

    async fn fetch_chapter_audio(&self, reciter_id: ReciterId, chapter_id: ChapterId) -> Result<Vec<AudioFile>> {
        let path = format!(
            "recitations/{}/by_chapter/{}?per_page={}",
            reciter_id, chapter_id, AUDIO_LISTING_PAGE_SIZE
        );
        let response: AudioFilesResponse = self.get_json(&path).await?;
        debug!(reciter_id, chapter_id, count = response.audio_files.len(), "fetched chapter audio listing");

        Ok(response
            .audio_files
            .into_iter()
            .map(|file| AudioFile {
                url: self.audio_url(&file.url),
                verse_key: file.verse_key,
            })
            .collect())
    }

    async fn fetch_binary(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| MaktabError::Network(format!("Failed to start download of {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(MaktabError::Network(format!("Download of {} failed: HTTP {}", url, response.status())));
        }

        let mut body = Vec::with_capacity(response.content_length().unwrap_or(0) as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| MaktabError::Network(format!("Error reading {}: {}", url, e)))?;
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }
}
