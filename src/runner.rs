use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;

use crate::{
    browser_controller::{ChromePage, InteractivePage},
    checkpoint::{CheckpointStore, MetadataCheckpoint},
    converter::{parse_results, ConversionDispatcher},
    crawler::{CrawlDriver, CrawlSettings, CrawlSummary},
    downloader::DownloadSettings,
    metadata::MetadataHarvester,
    types::{Pacing, PhaseSummary},
    utils::{
        BASE_URL, BOARD_LIST_PATH, BOARD_TYPE, CRAWL_CHECKPOINT, DOWNLOAD_ALL_SELECTOR,
        DOWNLOAD_DIR, FILE_DOWNLOAD_PATH, FILE_LIST_MARKER, HEADLESS, HOME_DIR, META_CHECKPOINT,
        METADATA_CSV, OUTPUT_DIR, PARSED_DIR, RESULT_CSV, STAGING_DIR,
    },
};

#[derive(Builder, Debug, Clone)]
#[builder(setter(into))]
pub struct RunnerOptions {
    // directory holding output/, downloads/ and the checkpoints
    #[builder(default = "self.default_base_dir()")]
    base_dir: PathBuf,
    #[builder(default = "BASE_URL.into()")]
    origin: String,
    #[builder(default = "BOARD_TYPE.into()")]
    board_type: String,
    #[builder(default = "*HEADLESS")]
    headless: bool,
    // browser timeout in seconds
    #[builder(default = "45")]
    browser_timeout: u64,
    // settle time after opening the listing root, in milliseconds
    #[builder(default = "2000")]
    settle_ms: u64,
    // settle time after each form navigation, in milliseconds
    #[builder(default = "500")]
    navigation_settle_ms: u64,
    #[builder(default = "800")]
    page_delay_ms: u64,
    #[builder(default = "1500")]
    record_delay_ms: u64,
    // maximum wait for the file inventory of a detail view, in seconds
    #[builder(default = "15")]
    file_list_wait: u64,
    #[builder(default = "500")]
    file_list_poll_ms: u64,
    // maximum wait for one download, in seconds
    #[builder(default = "30")]
    download_timeout: u64,
    #[builder(default = "5")]
    checkpoint_every: usize,
    #[builder(default = "50")]
    progress_every: u32,
}

impl RunnerOptionsBuilder {
    pub fn default_builder() -> RunnerOptionsBuilder {
        RunnerOptionsBuilder::default()
    }
}

impl RunnerOptions {
    pub fn output_dir(&self) -> PathBuf {
        self.base_dir.join(OUTPUT_DIR)
    }

    pub fn metadata_table(&self) -> PathBuf {
        self.output_dir().join(METADATA_CSV)
    }

    pub fn result_table(&self) -> PathBuf {
        self.output_dir().join(RESULT_CSV)
    }

    pub fn parsed_dir(&self) -> PathBuf {
        self.output_dir().join(PARSED_DIR)
    }

    pub fn download_dir(&self) -> PathBuf {
        self.base_dir.join(DOWNLOAD_DIR)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.download_dir().join(STAGING_DIR)
    }

    pub fn metadata_checkpoint(&self) -> PathBuf {
        self.base_dir.join(META_CHECKPOINT)
    }

    pub fn crawl_checkpoint(&self) -> PathBuf {
        self.base_dir.join(CRAWL_CHECKPOINT)
    }

    pub fn list_url(&self) -> String {
        format!("{}{}", self.origin.trim_end_matches('/'), BOARD_LIST_PATH)
    }

    pub fn pacing(&self) -> Pacing {
        Pacing {
            settle: Duration::from_millis(self.settle_ms),
            navigation_settle: Duration::from_millis(self.navigation_settle_ms),
            page_delay: Duration::from_millis(self.page_delay_ms),
            record_delay: Duration::from_millis(self.record_delay_ms),
            ..Pacing::default()
        }
    }

    pub fn crawl_settings(&self) -> CrawlSettings {
        CrawlSettings {
            list_url: self.list_url(),
            file_list_marker: FILE_LIST_MARKER.into(),
            file_list_wait: Duration::from_secs(self.file_list_wait),
            file_list_poll: Duration::from_millis(self.file_list_poll_ms),
            checkpoint_every: self.checkpoint_every,
            pacing: self.pacing(),
            download: DownloadSettings {
                download_dir: self.download_dir(),
                board_type: self.board_type.clone(),
                primary_selector: DOWNLOAD_ALL_SELECTOR.into(),
                fallback_path: FILE_DOWNLOAD_PATH.into(),
                timeout: Duration::from_secs(self.download_timeout),
            },
        }
    }
}

impl RunnerOptionsBuilder {
    fn default_base_dir(&self) -> PathBuf {
        HOME_DIR.clone()
    }
}

/// Sequences the three phases. Each phase owns its browser session.
pub struct Runner {
    options: RunnerOptions,
    should_terminate: Arc<AtomicBool>,
}

impl Runner {
    pub fn new(options: RunnerOptions, should_terminate: Arc<AtomicBool>) -> Self {
        Runner {
            options,
            should_terminate,
        }
    }

    fn launch_browser(&self) -> anyhow::Result<ChromePage> {
        ChromePage::launch(
            &self.options.origin,
            &self.options.staging_dir(),
            self.options.headless,
            Duration::from_secs(self.options.browser_timeout),
        )
        .context("could not start the browser")
    }

    pub async fn run_metadata_with<P: InteractivePage>(
        &self,
        page: &P,
    ) -> anyhow::Result<PhaseSummary> {
        let harvester = MetadataHarvester::new(
            page,
            &self.options.list_url(),
            self.options.metadata_table(),
            CheckpointStore::<MetadataCheckpoint>::new(self.options.metadata_checkpoint()),
            self.options.pacing(),
        )
        .progress_every(self.options.progress_every)
        .should_terminate(self.should_terminate.clone());

        harvester.run().await.context("metadata phase failed")
    }

    pub async fn run_crawl_with<P: InteractivePage>(
        &self,
        page: &P,
    ) -> anyhow::Result<CrawlSummary> {
        let driver = CrawlDriver::new(
            page,
            self.options.crawl_settings(),
            self.options.metadata_table(),
            self.options.result_table(),
            self.options.crawl_checkpoint(),
        )
        .should_terminate(self.should_terminate.clone());

        driver.run().await.context("crawl phase failed")
    }

    pub async fn run_metadata(&self) -> anyhow::Result<PhaseSummary> {
        let page = self.launch_browser()?;
        self.run_metadata_with(&page).await
    }

    pub async fn run_crawl(&self) -> anyhow::Result<CrawlSummary> {
        // fail on a missing metadata table before paying for a browser
        let metadata = self.options.metadata_table();
        if !metadata.exists() {
            anyhow::bail!("{:?} not found, run the metadata phase first", metadata);
        }
        let page = self.launch_browser()?;
        self.run_crawl_with(&page).await
    }

    pub fn run_parse(&self) -> anyhow::Result<PhaseSummary> {
        parse_results(
            &ConversionDispatcher,
            &self.options.result_table(),
            &self.options.parsed_dir(),
        )
        .context("parse phase failed")
    }

    pub async fn run_all(&self) -> anyhow::Result<()> {
        self.run_metadata().await?;
        if self.terminated() {
            return Ok(());
        }
        self.run_crawl().await?;
        if self.terminated() {
            return Ok(());
        }
        self.run_parse()?;
        Ok(())
    }

    pub fn terminated(&self) -> bool {
        self.should_terminate.load(Ordering::Relaxed)
    }
}
