use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::time::sleep;

use crate::{
    browser_controller::InteractivePage,
    checkpoint::{CheckpointStore, MetadataCheckpoint},
    listing::{navigate, open_listing, page_intent, parse_listing, reestablish_session},
    pagination::{self, page_argument, PageBounds},
    table::TableWriter,
    types::{CrawlerError, Pacing, PhaseSummary},
};

pub const METADATA_HEADER: [&str; 6] =
    ["seq", "display_num", "title", "date", "views", "board_secret"];

/// Walks the listing page by page, appending every entry to the metadata
/// table and checkpointing after each page.
///
/// A page that fails on the network is logged and skipped for the rest of the
/// run. It is not checkpointed, but later pages are, so it only gets picked up
/// again if the checkpoint is rolled back. Local failures abort the run.
pub struct MetadataHarvester<'a, P> {
    page: &'a P,
    list_url: String,
    table: PathBuf,
    checkpoint: CheckpointStore<MetadataCheckpoint>,
    pacing: Pacing,
    progress_every: u32,
    should_terminate: Arc<AtomicBool>,
}

impl<'a, P: InteractivePage> MetadataHarvester<'a, P> {
    pub fn new(
        page: &'a P,
        list_url: &str,
        table: PathBuf,
        checkpoint: CheckpointStore<MetadataCheckpoint>,
        pacing: Pacing,
    ) -> Self {
        MetadataHarvester {
            page,
            list_url: list_url.into(),
            table,
            checkpoint,
            pacing,
            progress_every: 50,
            should_terminate: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn progress_every(mut self, pages: u32) -> Self {
        self.progress_every = pages.max(1);
        self
    }

    pub fn should_terminate(mut self, flag: Arc<AtomicBool>) -> Self {
        self.should_terminate = flag;
        self
    }

    fn resume_state(&self) -> Result<MetadataCheckpoint, CrawlerError> {
        let state = self.checkpoint.load()?;
        if state.last_page > 0 && !self.table.exists() {
            warn!(
                "{:?} says page {} but {:?} is gone, starting over",
                self.checkpoint.path(),
                state.last_page,
                self.table
            );
            return Ok(MetadataCheckpoint::default());
        }
        Ok(state)
    }

    /// Bounds of the listing, with an in-page query of the last page control
    /// when the markup heuristics come up short.
    async fn bounds(&self, html: &str) -> PageBounds {
        let mut bounds = pagination::discover(html);
        if bounds.max_page <= 1 {
            match self
                .page
                .query_attribute(".pagination .last", "href")
                .await
            {
                Ok(Some(href)) => {
                    if let Some(page) = page_argument(&href) {
                        bounds.max_page = page.max(1);
                    }
                }
                Ok(None) => {}
                Err(e) => debug!("last page query failed: {}", e),
            }
        }
        bounds
    }

    async fn harvest_page(
        &self,
        page_no: u32,
        writer: &mut TableWriter,
    ) -> Result<usize, CrawlerError> {
        navigate(self.page, &page_intent(page_no), &self.pacing).await?;
        let html = self.page.content().await?;
        let listing = parse_listing(&html);
        if listing.skipped > 0 {
            debug!("page {}: {} entries without id", page_no, listing.skipped);
        }
        writer.append_all(&listing.records)?;
        Ok(listing.records.len())
    }

    pub async fn run(&self) -> Result<PhaseSummary, CrawlerError> {
        let mut state = self.resume_state()?;
        info!("metadata checkpoint: {} pages done", state.last_page);

        let mut writer = TableWriter::open(&self.table, &METADATA_HEADER, state.last_page > 0)?;
        let mut summary = PhaseSummary {
            output: self.table.clone(),
            ..Default::default()
        };

        open_listing(self.page, &self.list_url, &self.pacing).await?;
        let html = self.page.content().await?;
        let bounds = self.bounds(&html).await;
        info!(
            "{} pages, {} records announced",
            bounds.max_page, bounds.total_count
        );

        let mut start = state.last_page + 1;
        if start == 1 {
            let listing = parse_listing(&html);
            writer.append_all(&listing.records)?;
            summary.processed += listing.records.len();
            summary.skipped += listing.skipped;
            state.advance(1);
            self.checkpoint.save(&state)?;
            info!(
                "[1/{}] {} records (total: {})",
                bounds.max_page,
                listing.records.len(),
                summary.processed
            );
            start = 2;
        }

        for page_no in start..=bounds.max_page {
            if self.should_terminate.load(Ordering::Relaxed) {
                warn!("stopping before page {}", page_no);
                break;
            }

            match self.harvest_page(page_no, &mut writer).await {
                Ok(count) => {
                    summary.processed += count;
                    state.advance(page_no);
                    self.checkpoint.save(&state)?;
                    if page_no % self.progress_every == 0 || page_no == bounds.max_page {
                        info!(
                            "[{}/{}] {} records (total: {})",
                            page_no, bounds.max_page, count, summary.processed
                        );
                    }
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    summary.errors += 1;
                    error!("page {} failed: {}", page_no, e);
                    reestablish_session(self.page, &self.list_url, &self.pacing).await;
                    continue;
                }
            }

            sleep(self.pacing.page_delay).await;
        }

        info!(
            "metadata done: {} records, {} failed pages -> {:?}",
            summary.processed, summary.errors, summary.output
        );
        Ok(summary)
    }
}
