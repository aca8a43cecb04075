#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    fs,
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use aptcrawl::{
    browser_controller::InteractivePage,
    file_discovery::CaptureSlot,
    types::{CrawlerError, DownloadTrigger, MetadataRecord, NavigationIntent},
    utils::{BOARD_LIST_PATH, BOARD_VIEW_PATH, DETAIL_BODY_SELECTOR},
};

fn entries_html(ids: &[(String, &str)]) -> String {
    let mut html = String::from("<html><body><p class=\"total\">총 <b>1,000</b>건</p><ul class=\"boardList\">");
    for (id, secret) in ids {
        html.push_str(&format!(
            r##"<li><div class="num">{id}</div><a class="headLine" href="#" onclick="goCheck({id}, {secret})">아파트{id} 장기수선계획서</a><p class="info"><span class="boardDate">2024.01.01</span><span>12</span></p></li>"##
        ));
    }
    html.push_str("</ul>");
    html
}

/// Listing markup whose page links were rendered by script, so none show up
/// in the document.
pub fn bare_listing_html(ids: &[(String, &str)]) -> String {
    entries_html(ids) + "</body></html>"
}

/// Listing markup with `ids` as public entries and links up to `max_page`.
pub fn listing_html(max_page: u32, ids: &[(String, &str)]) -> String {
    let mut html = entries_html(ids);
    html.push_str("<div class=\"pagination\">");
    for n in 1..=max_page.min(10) {
        html.push_str(&format!(r#"<a href="javascript:goList({n})">{n}</a>"#));
    }
    html.push_str(&format!(
        r#"<a class="last" href="javascript:goList({max_page})">끝</a></div></body></html>"#
    ));
    html
}

pub fn record(id: &str, secret: &str) -> MetadataRecord {
    MetadataRecord {
        id: id.into(),
        display_index: id.into(),
        title: format!("아파트{} 장기수선계획서", id),
        date: "2024.01.01".into(),
        view_count: "12".into(),
        visibility_flag: secret.into(),
    }
}

/// How downloads of one record behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadMode {
    /// the download-all control works
    Primary,
    /// only the raw endpoint works
    FallbackOnly,
    /// nothing ever arrives
    Broken,
}

#[derive(Debug, Default)]
struct FakeState {
    current: String,
    current_record: Option<String>,
    slot: Option<(String, CaptureSlot)>,
    submissions: Vec<NavigationIntent>,
    downloads: Vec<DownloadTrigger>,
    gotos: usize,
    progress: usize,
}

/// Scripted stand-in for the browser page.
pub struct FakePage {
    pages: HashMap<u32, String>,
    failing_pages: HashSet<u32>,
    failing_records: HashSet<String>,
    inventories: HashMap<String, String>,
    detail_text: HashMap<String, String>,
    download_modes: HashMap<String, DownloadMode>,
    broken_records: HashSet<String>,
    failing_return: bool,
    last_page_href: Option<String>,
    stop: Option<(Arc<AtomicBool>, usize)>,
    staging: PathBuf,
    state: Mutex<FakeState>,
}

impl FakePage {
    pub fn new(staging: &Path) -> Self {
        fs::create_dir_all(staging).unwrap();
        FakePage {
            pages: HashMap::new(),
            failing_pages: HashSet::new(),
            failing_records: HashSet::new(),
            inventories: HashMap::new(),
            detail_text: HashMap::new(),
            download_modes: HashMap::new(),
            broken_records: HashSet::new(),
            failing_return: false,
            last_page_href: None,
            stop: None,
            staging: staging.to_path_buf(),
            state: Mutex::new(FakeState::default()),
        }
    }

    /// `max_page` listing pages of `per_page` public entries. Ids are
    /// `page * 100 + i`.
    pub fn with_listing(mut self, max_page: u32, per_page: u32) -> Self {
        for page in 1..=max_page {
            let ids = (0..per_page)
                .map(|i| ((page * 100 + i).to_string(), "0"))
                .collect::<Vec<_>>();
            self.pages.insert(page, listing_html(max_page, &ids));
        }
        self
    }

    /// Like `with_listing`, but without any pagination markup.
    pub fn with_bare_listing(mut self, max_page: u32, per_page: u32) -> Self {
        for page in 1..=max_page {
            let ids = (0..per_page)
                .map(|i| ((page * 100 + i).to_string(), "0"))
                .collect::<Vec<_>>();
            self.pages.insert(page, bare_listing_html(&ids));
        }
        self
    }

    /// What an in-page query of the last page control's href returns.
    pub fn with_last_page_href(mut self, href: &str) -> Self {
        self.last_page_href = Some(href.into());
        self
    }

    /// Raises `flag` once `n` listing pages or detail views have loaded.
    pub fn stop_after(mut self, flag: Arc<AtomicBool>, n: usize) -> Self {
        self.stop = Some((flag, n));
        self
    }

    /// Opening record `id` fails locally, which no retry can fix.
    pub fn broken_record(mut self, id: &str) -> Self {
        self.broken_records.insert(id.into());
        self
    }

    /// Returning from a detail view to the listing always fails.
    pub fn failing_return(mut self) -> Self {
        self.failing_return = true;
        self
    }

    pub fn failing_page(mut self, page: u32) -> Self {
        self.failing_pages.insert(page);
        self
    }

    pub fn failing_record(mut self, id: &str) -> Self {
        self.failing_records.insert(id.into());
        self
    }

    /// Announces `files` as (name, seq) pairs for record `id`.
    pub fn with_files(mut self, id: &str, files: &[(&str, u32)], mode: DownloadMode) -> Self {
        let data = files
            .iter()
            .map(|(name, seq)| serde_json::json!({"fileName": name, "seq": seq, "boardSeq": id}))
            .collect::<Vec<_>>();
        self.inventories.insert(
            id.into(),
            serde_json::json!({"code": "SCC", "data": data}).to_string(),
        );
        self.download_modes.insert(id.into(), mode);
        self
    }

    pub fn with_detail_text(mut self, id: &str, text: &str) -> Self {
        self.detail_text.insert(id.into(), text.into());
        self
    }

    pub fn submissions(&self) -> Vec<NavigationIntent> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn downloads(&self) -> Vec<DownloadTrigger> {
        self.state.lock().unwrap().downloads.clone()
    }

    pub fn gotos(&self) -> usize {
        self.state.lock().unwrap().gotos
    }

    /// Pages requested through the listing form, in order.
    pub fn requested_pages(&self) -> Vec<u32> {
        self.submissions()
            .iter()
            .filter_map(|i| i.value_of("pageNo").and_then(|p| p.parse().ok()))
            .collect()
    }

    /// Records whose detail view was opened, in order.
    pub fn visited_records(&self) -> Vec<String> {
        self.submissions()
            .iter()
            .filter(|i| i.action == BOARD_VIEW_PATH)
            .filter_map(|i| i.value_of("seq").map(String::from))
            .collect()
    }

    fn page(&self, n: u32) -> String {
        self.pages.get(&n).cloned().unwrap_or_default()
    }

    fn loaded(&self, state: &mut FakeState) {
        state.progress += 1;
        if let Some((flag, n)) = &self.stop {
            if state.progress >= *n {
                flag.store(true, Ordering::SeqCst);
            }
        }
    }
}

impl InteractivePage for FakePage {
    async fn goto(&self, _url: &str) -> Result<(), CrawlerError> {
        let mut state = self.state.lock().unwrap();
        state.gotos += 1;
        state.current = self.page(1);
        state.current_record = None;
        Ok(())
    }

    async fn submit_form(&self, intent: &NavigationIntent) -> Result<(), CrawlerError> {
        let mut state = self.state.lock().unwrap();
        state.submissions.push(intent.clone());

        if intent.action == BOARD_VIEW_PATH {
            let id = intent.value_of("seq").unwrap_or_default().to_string();
            if self.failing_records.contains(&id) {
                return Err(CrawlerError::Navigation(format!("record {} unreachable", id)));
            }
            if self.broken_records.contains(&id) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "disk is read-only").into());
            }
            state.current = format!("<div class=\"boardV_cont\">{}</div>", id);
            state.current_record = Some(id.clone());
            if let (Some((_, slot)), Some(body)) = (&state.slot, self.inventories.get(&id)) {
                slot.offer(body, false);
            }
            self.loaded(&mut state);
            return Ok(());
        }

        if intent.action == BOARD_LIST_PATH {
            state.current_record = None;
            if let Some(page) = intent.value_of("pageNo").and_then(|p| p.parse::<u32>().ok()) {
                if self.failing_pages.contains(&page) {
                    return Err(CrawlerError::Navigation(format!("page {} unreachable", page)));
                }
                state.current = self.page(page);
                self.loaded(&mut state);
            } else if self.failing_return {
                return Err(CrawlerError::Navigation("listing did not load".into()));
            }
        }
        Ok(())
    }

    async fn wait_for_network_idle(&self) -> Result<(), CrawlerError> {
        Ok(())
    }

    async fn wait_for_selector(
        &self,
        _selector: &str,
        _timeout: Duration,
    ) -> Result<(), CrawlerError> {
        Ok(())
    }

    async fn content(&self) -> Result<String, CrawlerError> {
        Ok(self.state.lock().unwrap().current.clone())
    }

    async fn query_text(&self, selector: &str) -> Result<Option<String>, CrawlerError> {
        let state = self.state.lock().unwrap();
        if selector != DETAIL_BODY_SELECTOR {
            return Ok(None);
        }
        Ok(state
            .current_record
            .as_ref()
            .and_then(|id| self.detail_text.get(id).cloned()))
    }

    async fn query_attribute(
        &self,
        selector: &str,
        attribute: &str,
    ) -> Result<Option<String>, CrawlerError> {
        if selector == ".pagination .last" && attribute == "href" {
            return Ok(self.last_page_href.clone());
        }
        Ok(None)
    }

    async fn click(&self, _selector: &str) -> Result<(), CrawlerError> {
        Ok(())
    }

    fn observe_responses(&self, url_marker: &str, slot: CaptureSlot) -> Result<(), CrawlerError> {
        self.state.lock().unwrap().slot = Some((url_marker.into(), slot));
        Ok(())
    }

    async fn await_download(
        &self,
        trigger: &DownloadTrigger,
        timeout: Duration,
    ) -> Result<PathBuf, CrawlerError> {
        let mut state = self.state.lock().unwrap();
        state.downloads.push(trigger.clone());
        let id = state.current_record.clone().unwrap_or_default();
        let mode = self
            .download_modes
            .get(&id)
            .copied()
            .unwrap_or(DownloadMode::Broken);

        let works = match (mode, trigger) {
            (DownloadMode::Primary, DownloadTrigger::Click(_)) => true,
            (DownloadMode::Primary, DownloadTrigger::SyntheticLink(_)) => true,
            (DownloadMode::FallbackOnly, DownloadTrigger::SyntheticLink(_)) => true,
            _ => false,
        };
        if !works {
            return Err(CrawlerError::Timeout(timeout, "download"));
        }

        let staged = self.staging.join(format!("{}-{}", id, state.downloads.len()));
        fs::write(&staged, format!("attachment of {}", id))?;
        Ok(staged)
    }
}
