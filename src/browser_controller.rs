use anyhow::Context;
use headless_chrome::protocol::cdp::Browser::{
    SetDownloadBehavior, SetDownloadBehaviorBehaviorOption,
};
use headless_chrome::protocol::cdp::Page::HandleJavaScriptDialog;
use headless_chrome::protocol::cdp::types::Event;
use headless_chrome::{browser::default_executable, Browser, LaunchOptions, Tab};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Weak},
    thread,
    time::{Duration, Instant},
};
use sysinfo::{Pid, PidExt, ProcessExt, System, SystemExt};
use tokio::time::sleep;

use crate::{
    file_discovery::CaptureSlot,
    types::{CrawlerError, DownloadTrigger, NavigationIntent},
};

const FILE_LIST_HANDLER: &str = "file-inventory";
const PARTIAL_DOWNLOAD_SUFFIX: &str = ".crdownload";
const DOWNLOAD_POLL: Duration = Duration::from_millis(250);

/// The browser page the pipeline drives. Navigation is stateful: most moves
/// are form submissions from the currently loaded page.
#[allow(async_fn_in_trait)]
pub trait InteractivePage {
    async fn goto(&self, url: &str) -> Result<(), CrawlerError>;

    async fn submit_form(&self, intent: &NavigationIntent) -> Result<(), CrawlerError>;

    async fn wait_for_network_idle(&self) -> Result<(), CrawlerError>;

    /// Waits up to `timeout` for `selector` to be present.
    async fn wait_for_selector(&self, selector: &str, timeout: Duration)
        -> Result<(), CrawlerError>;

    /// Rendered markup of the current document.
    async fn content(&self) -> Result<String, CrawlerError>;

    async fn query_text(&self, selector: &str) -> Result<Option<String>, CrawlerError>;

    async fn query_attribute(
        &self,
        selector: &str,
        attribute: &str,
    ) -> Result<Option<String>, CrawlerError>;

    async fn click(&self, selector: &str) -> Result<(), CrawlerError>;

    /// Routes bodies of responses whose url contains `url_marker` into `slot`,
    /// replacing any previously registered observer.
    fn observe_responses(&self, url_marker: &str, slot: CaptureSlot) -> Result<(), CrawlerError>;

    /// Fires `trigger` and waits for the resulting download. Returns the path
    /// of the completed artifact in the browser's download area.
    async fn await_download(
        &self,
        trigger: &DownloadTrigger,
        timeout: Duration,
    ) -> Result<PathBuf, CrawlerError>;
}

fn browser_err(e: anyhow::Error) -> CrawlerError {
    CrawlerError::Browser(format!("{:#}", e))
}

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "''".into())
}

pub fn form_submit_script(intent: &NavigationIntent) -> String {
    let form = format!("document[{}]", js_string(&intent.form));
    let mut script = String::from("(() => {\n");
    for (name, value) in &intent.fields {
        script.push_str(&format!(
            "    {}[{}].value = {};\n",
            form,
            js_string(name),
            js_string(value)
        ));
    }
    script.push_str(&format!(
        "    {form}.action = {};\n    {form}.submit();\n}})()",
        js_string(&intent.action),
    ));
    script
}

pub fn synthetic_link_script(url: &str) -> String {
    format!(
        r#"(() => {{
            const a = document.createElement('a');
            a.href = {};
            a.download = '';
            document.body.appendChild(a);
            a.click();
            a.remove();
        }})()"#,
        js_string(url)
    )
}

fn query_script(selector: &str, attribute: Option<&str>) -> String {
    let read = match attribute {
        Some(attr) => format!("el.getAttribute({})", js_string(attr)),
        None => "el.textContent".into(),
    };
    format!(
        "(() => {{ const el = document.querySelector({}); return el ? {} : null; }})()",
        js_string(selector),
        read
    )
}

/// Dismisses the open native dialog. Runs off the event thread, which has to
/// stay free to deliver the reply.
fn dismiss_dialog(tab: Weak<Tab>) {
    thread::spawn(move || {
        let tab = match tab.upgrade() {
            Some(tab) => tab,
            None => return,
        };
        debug!("dismissing native dialog");
        if let Err(e) = tab.call_method(HandleJavaScriptDialog {
            accept: false,
            prompt_text: None,
        }) {
            warn!("could not dismiss dialog: {}", e);
        }
    });
}

pub struct ChromePage {
    browser: Browser,
    tab: Arc<Tab>,
    staging_dir: PathBuf,
    origin: String,
}

impl ChromePage {
    pub fn launch(
        origin: &str,
        staging_dir: &Path,
        headless: bool,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let is_docker = std::env::var("IN_DOCKER").is_ok();
        let executable = default_executable()
            .map_err(|e| anyhow::anyhow!(e))
            .context("could not find a chrome binary")?;
        let options = LaunchOptions::default_builder()
            .path(Some(executable))
            .headless(headless)
            .window_size(Some((1920, 1080)))
            .idle_browser_timeout(timeout.max(Duration::from_secs(60)))
            // warning only do this if in docker env
            .sandbox(!is_docker)
            .build()
            .map_err(|e| anyhow::anyhow!(e))
            .context("invalid browser launch options")?;
        let browser = Browser::new(options).context("browser launching error")?;
        let tab = browser.new_tab().context("could not create new tab")?;
        tab.set_default_timeout(timeout);

        fs::create_dir_all(staging_dir)
            .context(format!("could not create {:?}", staging_dir))?;
        let staging_dir = fs::canonicalize(staging_dir)?;
        tab.call_method(SetDownloadBehavior {
            behavior: SetDownloadBehaviorBehaviorOption::Allow,
            browser_context_id: None,
            download_path: Some(staging_dir.to_string_lossy().into_owned()),
            events_enabled: None,
        })
        .context("could not route downloads")?;

        let dialog_tab = Arc::downgrade(&tab);
        tab.add_event_listener(Arc::new(move |event: &Event| {
            if let Event::PageJavascriptDialogOpening(_) = event {
                dismiss_dialog(dialog_tab.clone());
            }
        }))
        .context("could not watch for dialogs")?;

        Ok(ChromePage {
            browser,
            tab,
            staging_dir,
            origin: origin.trim_end_matches('/').into(),
        })
    }

    fn evaluate(&self, script: &str) -> Result<Option<serde_json::Value>, CrawlerError> {
        let res = self.tab.evaluate(script, false).map_err(browser_err)?;
        Ok(res.value)
    }

    fn absolute(&self, url: &str) -> String {
        if url.starts_with('/') {
            format!("{}{}", self.origin, url)
        } else {
            url.into()
        }
    }

    /// Clicks `selector`, waiting at most `timeout` for it to appear.
    fn click_within(&self, selector: &str, timeout: Duration) -> Result<(), CrawlerError> {
        let element = self
            .tab
            .wait_for_element_with_custom_timeout(selector, timeout)
            .map_err(|_| CrawlerError::Timeout(timeout, "download control"))?;
        element.click().map(|_| ()).map_err(browser_err)
    }

    fn clear_staging(&self) -> Result<(), CrawlerError> {
        for entry in fs::read_dir(&self.staging_dir)? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// A staged file that is complete and no longer growing.
    fn finished_download(&self, last_size: &mut Option<(PathBuf, u64)>) -> Option<PathBuf> {
        let entries = fs::read_dir(&self.staging_dir).ok()?;
        let candidate = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .find(|p| {
                !p.to_string_lossy().ends_with(PARTIAL_DOWNLOAD_SUFFIX)
                    && !p.to_string_lossy().ends_with(".tmp")
            })?;
        let size = fs::metadata(&candidate).ok()?.len();
        match last_size.replace((candidate.clone(), size)) {
            Some((prev, prev_size)) if prev == candidate && prev_size == size && size > 0 => {
                Some(candidate)
            }
            _ => None,
        }
    }

    pub fn kill(&self) -> bool {
        let pid = match self.browser.get_process_id() {
            Some(pid) => pid,
            None => return false,
        };
        let mut s = System::new();
        s.refresh_processes();
        if let Some(process) = s.process(Pid::from_u32(pid)) {
            debug!("killing browser process with id {}", pid);
            process.kill();
            return true;
        }
        false
    }
}

impl InteractivePage for ChromePage {
    async fn goto(&self, url: &str) -> Result<(), CrawlerError> {
        let url = self.absolute(url);
        debug!("navigating to {}", url);
        self.tab
            .navigate_to(&url)
            .map_err(|e| CrawlerError::Navigation(format!("{}: {:#}", url, e)))?;
        self.wait_for_network_idle().await
    }

    async fn submit_form(&self, intent: &NavigationIntent) -> Result<(), CrawlerError> {
        debug!("submitting {} to {}", intent.form, intent.action);
        self.evaluate(&form_submit_script(intent))
            .map_err(|e| CrawlerError::Navigation(e.to_string()))?;
        Ok(())
    }

    async fn wait_for_network_idle(&self) -> Result<(), CrawlerError> {
        if let Err(e) = self.tab.wait_until_navigated() {
            // one more timeout before giving up
            warn!("error waiting for navigation, retrying {}", e);
            self.tab
                .wait_until_navigated()
                .map_err(|e| CrawlerError::Navigation(format!("{:#}", e)))?;
        }
        Ok(())
    }

    async fn wait_for_selector(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), CrawlerError> {
        self.tab
            .wait_for_element_with_custom_timeout(selector, timeout)
            .map(|_| ())
            .map_err(|_| CrawlerError::Timeout(timeout, "selector"))
    }

    async fn content(&self) -> Result<String, CrawlerError> {
        self.tab.get_content().map_err(browser_err)
    }

    async fn query_text(&self, selector: &str) -> Result<Option<String>, CrawlerError> {
        let value = self.evaluate(&query_script(selector, None))?;
        Ok(value.and_then(|v| v.as_str().map(String::from)))
    }

    async fn query_attribute(
        &self,
        selector: &str,
        attribute: &str,
    ) -> Result<Option<String>, CrawlerError> {
        let value = self.evaluate(&query_script(selector, Some(attribute)))?;
        Ok(value.and_then(|v| v.as_str().map(String::from)))
    }

    async fn click(&self, selector: &str) -> Result<(), CrawlerError> {
        self.tab
            .find_element(selector)
            .and_then(|el| el.click().map(|_| ()))
            .map_err(browser_err)
    }

    fn observe_responses(&self, url_marker: &str, slot: CaptureSlot) -> Result<(), CrawlerError> {
        let marker = url_marker.to_string();
        self.tab
            .register_response_handling(
                FILE_LIST_HANDLER,
                Box::new(move |params, fetch_body| {
                    if !params.response.url.contains(&marker) {
                        return;
                    }
                    match fetch_body() {
                        Ok(body) => {
                            if !slot.offer(&body.body, body.base_64_encoded) {
                                debug!("ignored file inventory from {}", params.response.url);
                            }
                        }
                        Err(e) => warn!("could not read body of {}: {}", params.response.url, e),
                    }
                }),
            )
            .map(|_| ())
            .map_err(browser_err)
    }

    async fn await_download(
        &self,
        trigger: &DownloadTrigger,
        timeout: Duration,
    ) -> Result<PathBuf, CrawlerError> {
        self.clear_staging()?;
        match trigger {
            DownloadTrigger::Click(selector) => self.click_within(selector, timeout)?,
            DownloadTrigger::SyntheticLink(url) => {
                self.evaluate(&synthetic_link_script(url))?;
            }
        }

        let started = Instant::now();
        let mut last_size = None;
        while started.elapsed() < timeout {
            if let Some(path) = self.finished_download(&mut last_size) {
                return Ok(path);
            }
            sleep(DOWNLOAD_POLL).await;
        }
        Err(CrawlerError::Timeout(timeout, "download"))
    }
}

impl Drop for ChromePage {
    fn drop(&mut self) {
        debug!("killing browser process...");
        self.kill();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn form_script_sets_fields_then_submits() {
        let intent = NavigationIntent::new("listForm", "/web/board/view.do")
            .field("seq", "128980")
            .field("boardSecret", "0");
        let script = form_submit_script(&intent);
        assert!(script.contains(r#"document["listForm"]["seq"].value = "128980";"#));
        assert!(script.contains(r#"document["listForm"]["boardSecret"].value = "0";"#));
        let action = script.find(".action =").unwrap();
        let submit = script.find(".submit()").unwrap();
        assert!(script.find("boardSecret").unwrap() < action);
        assert!(action < submit);
    }

    #[test]
    fn scripts_escape_their_arguments() {
        let script = synthetic_link_script("/dl.do?a='1'&b=\"2\"");
        assert!(script.contains(r#"a.href = "/dl.do?a='1'&b=\"2\"";"#));
        let q = query_script(".pagination .last", Some("href"));
        assert!(q.contains(r#"document.querySelector(".pagination .last")"#));
        assert!(q.contains(r#"el.getAttribute("href")"#));
    }

    /*
    RUST_LOG=debug cargo test --lib browser_controller -- --ignored
     */
    #[test]
    #[ignore = "launches chrome"]
    fn launches_and_reads_content() {
        let dir = tempfile::tempdir().unwrap();
        let page = ChromePage::launch(
            crate::utils::BASE_URL,
            dir.path(),
            true,
            Duration::from_secs(30),
        )
        .unwrap();
        tokio_test::block_on(page.goto("about:blank")).unwrap();
        let html = tokio_test::block_on(page.content()).unwrap();
        assert!(html.contains("<html"));
    }

    fn launch_blank(dir: &Path) -> ChromePage {
        let page = ChromePage::launch(
            crate::utils::BASE_URL,
            dir,
            true,
            Duration::from_secs(30),
        )
        .unwrap();
        tokio_test::block_on(page.goto("about:blank")).unwrap();
        page
    }

    #[test]
    #[ignore = "launches chrome"]
    fn alert_does_not_block_later_calls() {
        let dir = tempfile::tempdir().unwrap();
        let page = launch_blank(dir.path());
        page.evaluate("setTimeout(() => alert('점검 중입니다'), 20)")
            .unwrap();
        std::thread::sleep(Duration::from_millis(500));

        let started = Instant::now();
        let body = tokio_test::block_on(page.query_text("body")).unwrap();
        assert!(body.is_some());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    #[ignore = "launches chrome"]
    fn missing_download_control_gives_up_within_the_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let page = launch_blank(dir.path());
        let started = Instant::now();
        let res = tokio_test::block_on(page.await_download(
            &DownloadTrigger::Click("#btn-all-files".into()),
            Duration::from_secs(1),
        ));
        assert!(matches!(res, Err(CrawlerError::Timeout(_, "download control"))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
