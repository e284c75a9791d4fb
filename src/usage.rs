//! Storage accountant

use crate::store::Store;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Snapshot of how much space the offline store takes.
///
/// `quota_bytes` is the configured cap, else what the store could grow to on
/// its volume (current use plus free space). Zero when neither is known.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageUsage {
    pub used_bytes: u64,
    pub quota_bytes: u64,
}

impl StorageUsage {
    /// Fraction of the quota in use, if there is one.
    pub fn fraction_used(&self) -> Option<f64> {
        (self.quota_bytes > 0).then(|| self.used_bytes as f64 / self.quota_bytes as f64)
    }
}

pub struct StorageAccountant {
    store: Arc<Store>,
}

impl StorageAccountant {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Current usage. Read-only; any failure reads as zero.
    pub async fn usage(&self) -> StorageUsage {
        match self.store.size().await {
            Ok(size) => StorageUsage {
                used_bytes: size.used_bytes,
                quota_bytes: size
                    .quota_bytes
                    .or_else(|| self.device_quota(size.used_bytes))
                    .unwrap_or(0),
            },
            Err(e) => {
                debug!(error = %e, "storage estimate unavailable");
                StorageUsage::default()
            }
        }
    }

    /// Room on the volume holding the database file.
    fn device_quota(&self, used_bytes: u64) -> Option<u64> {
        let dir = self.store.path()?.parent()?;
        match fs4::available_space(dir) {
            Ok(available) => Some(used_bytes.saturating_add(available)),
            Err(e) => {
                debug!(?dir, error = %e, "free space unavailable");
                None
            }
        }
    }
}

const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Human-readable byte count in 1024 steps: `0 B`, `512 B`, `1.5 KB`, `12.3 MB`.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = (value * 10.0).round() / 10.0;
    if rounded.fract() == 0.0 {
        format!("{} {}", rounded as u64, UNITS[unit])
    } else {
        format!("{:.1} {}", rounded, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quran::VerseKey;
    use crate::store::AudioRecord;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024 / 2), "1.5 GB");
    }

    #[tokio::test]
    async fn test_usage_grows_with_records() {
        let store = Arc::new(Store::in_memory());
        let accountant = StorageAccountant::new(Arc::clone(&store));
        let before = accountant.usage().await;
        assert!(before.used_bytes > 0);
        assert_eq!(before.quota_bytes, 0);
        assert_eq!(before.fraction_used(), None);

        store
            .put_audio(AudioRecord::new(7, VerseKey::new(1, 1), vec![1u8; 64 * 1024]))
            .await
            .unwrap();
        assert!(accountant.usage().await.used_bytes > before.used_bytes);
    }

    #[tokio::test]
    async fn test_usage_reports_quota() {
        let store = Arc::new(Store::in_memory().with_quota(Some(1024 * 1024)));
        let usage = StorageAccountant::new(store).usage().await;
        assert_eq!(usage.quota_bytes, 1024 * 1024);
        assert!(usage.fraction_used().unwrap() < 1.0);
    }

    #[tokio::test]
    async fn test_usage_falls_back_to_volume_space() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path().join("offline.db")));
        let usage = StorageAccountant::new(store).usage().await;
        assert!(usage.used_bytes > 0);
        assert!(usage.quota_bytes >= usage.used_bytes);
        assert!(usage.fraction_used().is_some());
    }

    #[tokio::test]
    async fn test_usage_is_zero_when_store_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path()));
        assert_eq!(StorageAccountant::new(store).usage().await, StorageUsage::default());
    }
}
