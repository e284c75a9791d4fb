//! Command handlers for the command-line shell

use anyhow::{bail, Context, Result};
use maktab_lib::quran::{juz_start_page, reciter_id, Chapter};
use maktab_lib::{
    format_bytes, AppState, AudioSource, ChapterId, DownloadProgress, DownloadReport, PageAudioSummary,
    PageNumber, ReciterId, RECITERS, TOTAL_CHAPTERS,
};
use serde::Serialize;
use std::io::Write;
use tokio::sync::mpsc;

/// Reciter for a command: explicit slug, else the configured one.
fn resolve_reciter(state: &AppState, slug: Option<&str>) -> ReciterId {
    slug.map(reciter_id).unwrap_or_else(|| state.settings.reciter_id())
}

fn resolve_lang(state: &AppState, lang: Option<String>) -> String {
    lang.unwrap_or_else(|| state.settings.translation_lang())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Run a job while a forwarding task renders its progress events.
async fn with_progress<F, Fut>(json: bool, job: F) -> Result<DownloadReport>
where
    F: FnOnce(mpsc::UnboundedSender<DownloadProgress>) -> Fut,
    Fut: std::future::Future<Output = Result<DownloadReport>>,
{
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<DownloadProgress>();

    let printer = tokio::spawn(async move {
        while let Some(progress) = progress_rx.recv().await {
            if json {
                if let Ok(line) = serde_json::to_string(&progress) {
                    println!("{}", line);
                }
            } else {
                eprint!(
                    "\r[{}/{}] {:<40} failed: {}",
                    progress.current, progress.total, progress.label, progress.failed
                );
                let _ = std::io::stderr().flush();
            }
        }
        if !json {
            eprintln!();
        }
    });

    // The job owns the only sender, so the printer ends once the job does
    let report = job(progress_tx).await;
    printer.await.context("Progress printer failed")?;
    report
}

fn print_report(report: &DownloadReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }
    println!(
        "Done: {}/{} processed, {} failed",
        report.progress.current, report.progress.total, report.progress.failed
    );
    println!("Downloaded chapters: {}", report.downloaded_chapters.len());
    println!("Storage used: {}", format_bytes(report.usage.used_bytes));
    Ok(())
}

// ============ Reading ============

pub async fn page(state: &AppState, page: Option<PageNumber>, juz: Option<u8>, lang: Option<String>, json: bool) -> Result<()> {
    let page_number = match (page, juz) {
        (Some(page), _) => page,
        (None, Some(juz)) => juz_start_page(juz),
        (None, None) => bail!("Either a page number or --juz is required"),
    };
    let lang = resolve_lang(state, lang);

    let page = state
        .resolver
        .resolve_page(page_number, &lang)
        .await
        .with_context(|| format!("Failed to load page {}", page_number))?;
    state.resolver.prefetch_neighbors(page_number, &lang).await;

    if json {
        return print_json(&page);
    }

    let chapters: Vec<&str> = page.chapters.iter().map(|c| c.name.as_str()).collect();
    println!(
        "Page {} | Juz {} | Hizb {} | {}",
        page.page_number,
        page.juz_number,
        page.hizb_number,
        chapters.join(", ")
    );
    for verse in &page.verses {
        println!();
        println!("({}) {}", verse.verse_key, verse.text_qpc_hafs.as_deref().unwrap_or(""));
        for translation in &verse.translations {
            println!("    {}", translation.text);
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct AudioEntry {
    verse_key: String,
    local: bool,
    bytes: Option<usize>,
    url: Option<String>,
}

pub async fn audio(state: &AppState, page: PageNumber, reciter: Option<&str>, lang: Option<String>, json: bool) -> Result<()> {
    let reciter_id = resolve_reciter(state, reciter);
    let lang = resolve_lang(state, lang);

    let entries = state.resolver.resolve_page_audio(page, reciter_id, &lang).await;
    let summary = PageAudioSummary::of(&entries);

    let rows: Vec<AudioEntry> = entries
        .into_iter()
        .map(|entry| match entry.source {
            AudioSource::Local(handle) => AudioEntry {
                verse_key: entry.verse_key.to_string(),
                local: true,
                bytes: Some(handle.len()),
                url: None,
            },
            AudioSource::Remote(url) => AudioEntry {
                verse_key: entry.verse_key.to_string(),
                local: false,
                bytes: None,
                url: Some(url),
            },
        })
        .collect();

    if json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        println!("No audio available for page {}", page);
        return Ok(());
    }
    for row in &rows {
        match (&row.url, row.bytes) {
            (Some(url), _) => println!("{:>8}  stream  {}", row.verse_key, url),
            (None, Some(bytes)) => println!("{:>8}  local   {}", row.verse_key, format_bytes(bytes as u64)),
            (None, None) => {}
        }
    }
    println!("{} local, {} streamed", summary.local, summary.remote);
    Ok(())
}

pub fn reciters(json: bool) -> Result<()> {
    if json {
        return print_json(&RECITERS);
    }
    for reciter in RECITERS {
        println!("{:<16} {:>3}  {}", reciter.slug, reciter.id, reciter.name);
    }
    Ok(())
}

// ============ Downloads ============

pub async fn download_text(state: &AppState, lang: Option<String>, json: bool) -> Result<()> {
    let lang = resolve_lang(state, lang);
    let report = with_progress(json, |tx| async move { Ok(state.downloader.download_text(&lang, &tx).await) }).await?;
    print_report(&report, json)
}

fn parse_chapters(chapters: &[ChapterId], all: bool) -> Result<Vec<ChapterId>> {
    if all {
        return Ok((1..=TOTAL_CHAPTERS).collect());
    }
    if chapters.is_empty() {
        bail!("No chapters given; pass chapter numbers or --all");
    }
    if let Some(bad) = chapters.iter().find(|&&c| c == 0 || c > TOTAL_CHAPTERS) {
        bail!("Chapter {} is out of range (1-{})", bad, TOTAL_CHAPTERS);
    }
    Ok(chapters.to_vec())
}

pub async fn download_audio(
    state: &AppState,
    chapters: &[ChapterId],
    all: bool,
    reciter: Option<&str>,
    lang: Option<String>,
    json: bool,
) -> Result<()> {
    let chapters = parse_chapters(chapters, all)?;
    let reciter_id = resolve_reciter(state, reciter);
    let lang = resolve_lang(state, lang);

    let report = with_progress(json, |tx| async move {
        Ok(state.downloader.download_audio(reciter_id, &chapters, &lang, &tx).await)
    })
    .await?;
    print_report(&report, json)
}

pub async fn download_page_audio(
    state: &AppState,
    page: PageNumber,
    reciter: Option<&str>,
    lang: Option<String>,
    json: bool,
) -> Result<()> {
    let reciter_id = resolve_reciter(state, reciter);
    let lang = resolve_lang(state, lang);

    let report = with_progress(json, |tx| async move {
        state
            .downloader
            .download_page_audio(page, reciter_id, &lang, &tx)
            .await
            .with_context(|| format!("Failed to load page {}", page))
    })
    .await?;
    print_report(&report, json)
}

// ============ Storage ============

#[derive(Serialize)]
struct DownloadedChapter {
    id: ChapterId,
    name: String,
    verses: usize,
    verses_count: Option<u16>,
}

pub async fn downloaded(state: &AppState, reciter: Option<&str>, json: bool) -> Result<()> {
    let reciter_id = resolve_reciter(state, reciter);
    let chapters = state.downloader.downloaded_chapters(reciter_id).await?;

    // Names are a nicety; offline the ids alone are listed
    let catalog: Vec<Chapter> = state.client.fetch_chapters().await.unwrap_or_default();

    let mut rows = Vec::with_capacity(chapters.len());
    for id in chapters {
        let verses = state.store.list_downloaded_verses(reciter_id, id).await?.len();
        let chapter = catalog.iter().find(|c| c.id == id);
        rows.push(DownloadedChapter {
            id,
            name: chapter.map(|c| c.name_simple.clone()).unwrap_or_default(),
            verses,
            verses_count: chapter.map(|c| c.verses_count),
        });
    }

    if json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        println!("No audio downloaded for reciter {}", reciter_id);
    }
    for row in &rows {
        let total = row.verses_count.map(|n| n.to_string()).unwrap_or_else(|| "?".to_string());
        println!("{:>3}  {:<20} {}/{}", row.id, row.name, row.verses, total);
    }
    Ok(())
}

pub async fn delete(state: &AppState, chapter: ChapterId, reciter: Option<&str>) -> Result<()> {
    let reciter_id = resolve_reciter(state, reciter);
    let removed = state.downloader.delete_chapter_audio(reciter_id, chapter).await?;
    println!("Removed {} verses of chapter {}", removed, chapter);
    Ok(())
}

#[derive(Serialize)]
struct UsageReport {
    used_bytes: u64,
    quota_bytes: u64,
    audio_records: u64,
    text_pages: u64,
}

pub async fn usage(state: &AppState, json: bool) -> Result<()> {
    let usage = state.accountant.usage().await;
    let stats = state.store.stats().await?;

    if json {
        return print_json(&UsageReport {
            used_bytes: usage.used_bytes,
            quota_bytes: usage.quota_bytes,
            audio_records: stats.audio_records,
            text_pages: stats.text_pages,
        });
    }

    match usage.fraction_used() {
        Some(fraction) => println!(
            "Storage: {} of {} ({:.1}%)",
            format_bytes(usage.used_bytes),
            format_bytes(usage.quota_bytes),
            fraction * 100.0
        ),
        None => println!("Storage: {}", format_bytes(usage.used_bytes)),
    }
    println!("Audio verses: {}", stats.audio_records);
    println!("Text pages:   {}", stats.text_pages);
    if let Some(path) = state.store.path() {
        println!("Database:     {}", path.display());
    }
    Ok(())
}

pub async fn clear(state: &AppState, yes: bool) -> Result<()> {
    if !yes {
        bail!("Refusing to clear the offline store without --yes");
    }
    state.store.clear_all().await?;
    println!("Offline store cleared");
    Ok(())
}
