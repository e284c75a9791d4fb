//! Maktab - offline Quran content cache
//!
//! Backend library keeping pages and recitations available offline: a SQLite
//! store, a cache-first resolver, bulk download jobs and storage accounting.

// Vocabulary types must be defined first as everything else uses them
pub mod quran;
pub mod error;
pub mod config;
pub mod store;
pub mod client;
pub mod resolver;
pub mod downloader;
pub mod usage;
pub mod state;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use error::{MaktabError, Result};
pub use state::AppState;
pub use config::{get_data_dir, Config, DownloadOptions, SettingsSource, StaticSettings};
pub use quran::{ChapterId, PageNumber, QuranPage, ReciterId, VerseKey, RECITERS, TOTAL_CHAPTERS, TOTAL_PAGES};
pub use store::{AudioRecord, Store, StoreStats, TextPageRecord};
pub use client::{ContentClient, HttpContentClient};
pub use resolver::{AudioHandle, AudioSource, CacheResolver, PageAudio, PageAudioSummary};
pub use downloader::{
    DownloadMode, DownloadOrchestrator, DownloadProgress, DownloadReport, DownloadState, ProgressSink,
};
pub use usage::{format_bytes, StorageAccountant, StorageUsage};
