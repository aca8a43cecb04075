use itertools::Itertools;
use regex::Regex;
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::sleep;

use crate::{
    browser_controller::InteractivePage,
    checkpoint::{CheckpointStore, CrawlCheckpoint, RecordQueue},
    downloader::{DownloadOrchestrator, DownloadSettings},
    file_discovery::{await_file_list, CaptureSlot},
    listing::{back_to_listing_intent, detail_intent, navigate, open_listing, reestablish_session},
    table::{read_table, TableWriter},
    types::{
        CrawlResultRecord, CrawlerError, DownloadOutcome, MetadataRecord, Pacing,
    },
    utils::{DETAIL_BODY_SELECTOR, FILE_LIST_MARKER, JOIN_SEPARATOR},
};

pub const RESULT_HEADER: [&str; 9] = [
    "seq",
    "display_num",
    "title",
    "date",
    "apt_name",
    "file_count",
    "file_names",
    "file_paths",
    "download_status",
];

lazy_static! {
    // complex names usually end in a brand or a generic suffix
    static ref ENTITY_PATTERNS: Vec<Regex> = vec![
        Regex::new(
            r"([\w가-힣]+(?:아파트|단지|맨션|빌라|타운|파크|힐스|캐슬|자이|래미안|e편한세상|푸르지오|더샵|롯데캐슬|코아루|한신더휴|포레나)[\w가-힣]*)"
        )
        .unwrap(),
        Regex::new(r"([\w가-힣]+\d+단지)").unwrap(),
    ];
}

/// Best-effort complex name: first pattern hit in the title, then in the
/// detail text, else the title itself.
pub fn derive_entity_name(title: &str, detail_text: &str) -> String {
    for text in [title, detail_text] {
        for pattern in ENTITY_PATTERNS.iter() {
            if let Some(m) = pattern.captures(text).and_then(|c| c.get(1)) {
                return m.as_str().to_string();
            }
        }
    }
    title.to_string()
}

#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub list_url: String,
    pub file_list_marker: String,
    pub file_list_wait: Duration,
    pub file_list_poll: Duration,
    pub checkpoint_every: usize,
    pub pacing: Pacing,
    pub download: DownloadSettings,
}

impl CrawlSettings {
    pub fn new(list_url: &str, download_dir: PathBuf) -> Self {
        CrawlSettings {
            list_url: list_url.into(),
            file_list_marker: FILE_LIST_MARKER.into(),
            file_list_wait: Duration::from_secs(15),
            file_list_poll: Duration::from_millis(500),
            checkpoint_every: 5,
            pacing: Pacing::default(),
            download: DownloadSettings::new(download_dir),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CrawlSummary {
    pub processed: usize,
    pub errors: usize,
    pub ok: usize,
    pub failed: usize,
    pub no_file: usize,
    pub output: PathBuf,
}

/// Visits every public record not yet done, one at a time, in listing order.
pub struct CrawlDriver<'a, P> {
    page: &'a P,
    settings: CrawlSettings,
    metadata_table: PathBuf,
    result_table: PathBuf,
    checkpoint: PathBuf,
    should_terminate: Arc<AtomicBool>,
}

impl<'a, P: InteractivePage> CrawlDriver<'a, P> {
    pub fn new(
        page: &'a P,
        settings: CrawlSettings,
        metadata_table: PathBuf,
        result_table: PathBuf,
        checkpoint: PathBuf,
    ) -> Self {
        CrawlDriver {
            page,
            settings,
            metadata_table,
            result_table,
            checkpoint,
            should_terminate: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn should_terminate(mut self, flag: Arc<AtomicBool>) -> Self {
        self.should_terminate = flag;
        self
    }

    /// Opens the detail view of `record`, collects its attachments and builds
    /// its result row.
    async fn process(&self, record: &MetadataRecord) -> Result<CrawlResultRecord, CrawlerError> {
        // fresh slot per visit so a late response can't leak into the next record
        let slot = CaptureSlot::new();
        self.page
            .observe_responses(&self.settings.file_list_marker, slot.clone())?;

        navigate(self.page, &detail_intent(&record.id), &self.settings.pacing).await?;

        let files = await_file_list(
            &slot,
            &record.id,
            self.settings.file_list_wait,
            self.settings.file_list_poll,
        )
        .await;

        let detail_text = match self.page.query_text(DETAIL_BODY_SELECTOR).await {
            Ok(text) => text.unwrap_or_default(),
            Err(e) => {
                debug!("no detail text for {}: {}", record.id, e);
                String::new()
            }
        };

        let orchestrator = DownloadOrchestrator::new(self.page, self.settings.download.clone());
        let results = orchestrator.materialize_all(&files).await;
        let outcome = DownloadOutcome::classify(&results);

        Ok(CrawlResultRecord {
            id: record.id.clone(),
            display_index: record.display_index.clone(),
            title: record.title.clone(),
            date: record.date.clone(),
            derived_entity_name: derive_entity_name(&record.title, &detail_text),
            file_count: files.len(),
            file_names: files.iter().map(|f| f.file_name.as_str()).join(JOIN_SEPARATOR),
            file_paths: results.iter().map(|r| r.path_string()).join(JOIN_SEPARATOR),
            outcome,
        })
    }

    pub async fn run(&self) -> Result<CrawlSummary, CrawlerError> {
        let records: Vec<MetadataRecord> = read_table(&self.metadata_table)?;
        let mut queue = RecordQueue::open(
            CheckpointStore::<CrawlCheckpoint>::new(&self.checkpoint),
            records,
            self.settings.checkpoint_every,
        )?;
        let mut summary = CrawlSummary {
            output: self.result_table.clone(),
            ..Default::default()
        };

        info!(
            "{} public records, {} done, {} remaining",
            queue.total(),
            queue.done_count(),
            queue.remaining()
        );
        if queue.remaining() == 0 {
            info!("nothing left to crawl");
            return Ok(summary);
        }
        let to_do = queue.remaining();

        let append = self.result_table.exists() && queue.done_count() > 0;
        let mut writer = TableWriter::open(&self.result_table, &RESULT_HEADER, append)?;

        open_listing(self.page, &self.settings.list_url, &self.settings.pacing).await?;

        let res = self
            .drain(&mut queue, &mut writer, &mut summary, to_do)
            .await;
        // completions since the last flush are kept even when aborting
        queue.flush()?;
        res?;

        info!(
            "crawl done: {} processed ({} ok, {} failed, {} without files), {} errors -> {:?}",
            summary.processed,
            summary.ok,
            summary.failed,
            summary.no_file,
            summary.errors,
            summary.output
        );
        Ok(summary)
    }

    /// Consumes the queue until it is empty or a stop is requested. Transient
    /// failures re-establish the session and move on, anything else aborts.
    async fn drain(
        &self,
        queue: &mut RecordQueue,
        writer: &mut TableWriter,
        summary: &mut CrawlSummary,
        to_do: usize,
    ) -> Result<(), CrawlerError> {
        while let Some(record) = queue.next() {
            if self.should_terminate.load(Ordering::Relaxed) {
                warn!("stopping before record {}", record.id);
                break;
            }
            if queue.is_done(&record.id) {
                debug!("record {} already done", record.id);
                continue;
            }

            match self.process(&record).await {
                Ok(row) => {
                    // the row goes out before the id is marked done
                    writer.append(&row)?;
                    summary.processed += 1;
                    match row.outcome {
                        DownloadOutcome::Ok => summary.ok += 1,
                        DownloadOutcome::Fail => summary.failed += 1,
                        DownloadOutcome::NoFile => summary.no_file += 1,
                    }
                    if queue.complete(&row.id)? {
                        info!(
                            "[{}/{}] {} -> {:?}",
                            summary.processed,
                            to_do,
                            row.title.chars().take(50).collect::<String>(),
                            row.outcome
                        );
                    }

                    if let Err(e) = navigate(
                        self.page,
                        &back_to_listing_intent(),
                        &self.settings.pacing,
                    )
                    .await
                    {
                        if !e.is_transient() {
                            return Err(e);
                        }
                        summary.errors += 1;
                        error!("could not return to listing after {}: {}", record.id, e);
                        reestablish_session(self.page, &self.settings.list_url, &self.settings.pacing)
                            .await;
                    }
                }
                Err(e) if e.is_transient() => {
                    summary.errors += 1;
                    error!("[error {}] record {}: {}", summary.errors, record.id, e);
                    reestablish_session(self.page, &self.settings.list_url, &self.settings.pacing)
                        .await;
                }
                Err(e) => return Err(e),
            }

            sleep(self.settings.pacing.record_delay).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn entity_name_from_title() {
        assert_eq!(
            derive_entity_name("은마아파트 장기수선계획서 공개", ""),
            "은마아파트"
        );
        assert_eq!(
            derive_entity_name("2024년 반포래미안퍼스티지 장기수선계획", ""),
            "반포래미안퍼스티지"
        );
    }

    #[test]
    fn entity_name_falls_back_to_detail_text_then_title() {
        assert_eq!(
            derive_entity_name("장기수선계획서", "관리주체: 상계주공7단지 관리사무소"),
            "상계주공7단지"
        );
        assert_eq!(derive_entity_name("장기수선계획서", "내용 없음"), "장기수선계획서");
    }
}
