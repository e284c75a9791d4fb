//! Quran content vocabulary: verse keys, catalog ids and API payload types

use crate::error::{MaktabError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Number of pages in the standard Madani print layout.
pub const TOTAL_PAGES: PageNumber = 604;
/// Number of chapters (surahs).
pub const TOTAL_CHAPTERS: ChapterId = 114;

pub type ReciterId = u32;
pub type ChapterId = u16;
pub type PageNumber = u16;

/// Address of a single verse, written `chapter:verse` (e.g. `2:255`).
///
/// Ordering is numeric by chapter then verse, which is reading order.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VerseKey {
    pub chapter: ChapterId,
    pub verse: u16,
}

impl VerseKey {
    pub fn new(chapter: ChapterId, verse: u16) -> Self {
        Self { chapter, verse }
    }
}

impl fmt::Display for VerseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chapter, self.verse)
    }
}

impl FromStr for VerseKey {
    type Err = MaktabError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || MaktabError::InvalidVerseKey(s.to_string());
        let (chapter, verse) = s.split_once(':').ok_or_else(invalid)?;
        let chapter: ChapterId = chapter.trim().parse().map_err(|_| invalid())?;
        let verse: u16 = verse.trim().parse().map_err(|_| invalid())?;
        if chapter == 0 || chapter > TOTAL_CHAPTERS || verse == 0 {
            return Err(invalid());
        }
        Ok(Self { chapter, verse })
    }
}

impl TryFrom<String> for VerseKey {
    type Error = MaktabError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<VerseKey> for String {
    fn from(key: VerseKey) -> Self {
        key.to_string()
    }
}

// ============ API payload types ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslatedName {
    #[serde(default)]
    pub language_name: String,
    pub name: String,
}

/// Chapter metadata as served by the content API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: ChapterId,
    #[serde(default)]
    pub revelation_place: String,
    #[serde(default)]
    pub revelation_order: u16,
    #[serde(default)]
    pub bismillah_pre: bool,
    pub name_simple: String,
    #[serde(default)]
    pub name_complex: String,
    pub name_arabic: String,
    pub verses_count: u16,
    /// First and last page the chapter spans (inclusive).
    pub pages: [PageNumber; 2],
    pub translated_name: Option<TranslatedName>,
}

impl Chapter {
    pub fn page_range(&self) -> std::ops::RangeInclusive<PageNumber> {
        self.pages[0]..=self.pages[1]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Translation {
    #[serde(default)]
    pub id: u32,
    pub text: String,
    #[serde(default)]
    pub resource_id: u32,
    #[serde(default)]
    pub resource_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub id: u32,
    pub position: u16,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub char_type_name: String,
    #[serde(default)]
    pub text_qpc_hafs: Option<String>,
    #[serde(default)]
    pub line_number: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verse {
    pub id: u32,
    pub verse_number: u16,
    pub verse_key: VerseKey,
    pub page_number: PageNumber,
    #[serde(default)]
    pub juz_number: u8,
    #[serde(default)]
    pub hizb_number: u16,
    #[serde(default)]
    pub text_qpc_hafs: Option<String>,
    #[serde(default)]
    pub translations: Vec<Translation>,
    #[serde(default)]
    pub words: Vec<Word>,
}

/// One entry of a chapter's recitation listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFile {
    pub verse_key: VerseKey,
    pub url: String,
}

/// Chapter boundary shown on a page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageChapter {
    pub id: ChapterId,
    pub name: String,
    pub name_arabic: String,
}

/// Everything needed to render one printed page offline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuranPage {
    pub page_number: PageNumber,
    pub verses: Vec<Verse>,
    pub chapters: Vec<PageChapter>,
    pub juz_number: u8,
    pub hizb_number: u16,
}

impl QuranPage {
    /// Assemble a page from its verses, deriving juz/hizb from the first verse.
    pub fn new(page_number: PageNumber, verses: Vec<Verse>, chapters: Vec<PageChapter>) -> Self {
        let juz_number = verses.first().map(|v| v.juz_number).filter(|&j| j > 0).unwrap_or(1);
        let hizb_number = verses.first().map(|v| v.hizb_number).filter(|&h| h > 0).unwrap_or(1);
        Self {
            page_number,
            verses,
            chapters,
            juz_number,
            hizb_number,
        }
    }

    /// Verse keys in page order.
    pub fn verse_keys(&self) -> Vec<VerseKey> {
        self.verses.iter().map(|v| v.verse_key).collect()
    }

    /// Distinct chapters touched by this page, ascending.
    pub fn chapter_ids(&self) -> BTreeSet<ChapterId> {
        self.verses.iter().map(|v| v.verse_key.chapter).collect()
    }
}

// ============ Catalogs ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reciter {
    pub slug: &'static str,
    pub name: &'static str,
    pub id: ReciterId,
}

pub const DEFAULT_RECITER: ReciterId = 7;

pub const RECITERS: &[Reciter] = &[
    Reciter { slug: "mishary-rashid", name: "Mishary Rashid Alafasy", id: 7 },
    Reciter { slug: "abdul-basit", name: "Abdul Basit", id: 2 },
    Reciter { slug: "sudais", name: "Abdur-Rahman as-Sudais", id: 3 },
    Reciter { slug: "minshawi", name: "Mohamed Siddiq al-Minshawi", id: 9 },
    Reciter { slug: "husary", name: "Mahmoud Khalil Al-Husary", id: 6 },
    Reciter { slug: "ghamdi", name: "Abu Bakr al-Shatri", id: 4 },
];

/// Look up a reciter id by slug, falling back to Alafasy.
pub fn reciter_id(slug: &str) -> ReciterId {
    RECITERS
        .iter()
        .find(|r| r.slug == slug)
        .map(|r| r.id)
        .unwrap_or(DEFAULT_RECITER)
}

/// Translation resource id for a language code, falling back to English.
pub fn translation_id(lang: &str) -> u32 {
    match lang {
        "ha" => 32, // Abubakar Mahmoud Gumi
        _ => 20,    // Saheeh International
    }
}

const JUZ_START_PAGES: [PageNumber; 30] = [
    1, 22, 42, 62, 82, 102, 121, 142, 162, 182, 201, 222, 242, 262, 282, 302, 322, 342, 362, 382,
    402, 422, 442, 462, 482, 502, 522, 542, 562, 582,
];

/// First page of a juz (1-based); unknown juz numbers map to page 1.
pub fn juz_start_page(juz: u8) -> PageNumber {
    usize::from(juz)
        .checked_sub(1)
        .and_then(|idx| JUZ_START_PAGES.get(idx))
        .copied()
        .unwrap_or(1)
}

const VERSE_COUNTS: [u16; TOTAL_CHAPTERS as usize] = [
    7, 286, 200, 176, 120, 165, 206, 75, 129, 109, 123, 111, 43, 52, 99, 128, 111, 110, 98, 135,
    112, 78, 118, 64, 77, 227, 93, 88, 69, 60, 34, 30, 73, 54, 45, 83, 182, 88, 75, 85,
    54, 53, 89, 59, 37, 35, 38, 29, 18, 45, 60, 49, 62, 55, 78, 96, 29, 22, 24, 13,
    14, 11, 11, 18, 12, 12, 30, 52, 52, 44, 28, 28, 20, 56, 40, 31, 50, 40, 46, 42,
    29, 19, 36, 25, 22, 17, 19, 26, 30, 20, 15, 21, 11, 8, 8, 19, 5, 8, 8, 11,
    11, 8, 3, 9, 5, 4, 7, 3, 6, 3, 5, 4, 5, 6,
];

/// Number of verses in a chapter, `None` outside 1..=114.
pub fn verse_count(chapter: ChapterId) -> Option<u16> {
    usize::from(chapter)
        .checked_sub(1)
        .and_then(|idx| VERSE_COUNTS.get(idx))
        .copied()
}

pub fn is_valid_page(page: PageNumber) -> bool {
    (1..=TOTAL_PAGES).contains(&page)
}
