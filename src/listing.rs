use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::time::Duration;
use tokio::time::sleep;
use tokio_retry::{strategy::FixedInterval, Retry};

use crate::{
    browser_controller::InteractivePage,
    types::{CrawlerError, MetadataRecord, NavigationIntent, Pacing},
    utils::{
        BOARD_LIST_PATH, BOARD_VIEW_PATH, LIST_FORM, PAGINATION_SELECTOR, POPUP_CLOSE_SELECTORS,
        PUBLIC_BOARD_SECRET,
    },
};

lazy_static! {
    static ref ENTRY: Selector = Selector::parse("ul.boardList > li").unwrap();
    static ref NUM: Selector = Selector::parse("div.num").unwrap();
    static ref HEADLINE: Selector = Selector::parse("a.headLine").unwrap();
    static ref DATE: Selector = Selector::parse("span.boardDate").unwrap();
    static ref INFO_SPANS: Selector = Selector::parse("p.info span").unwrap();
    static ref GO_CHECK: Regex = Regex::new(r"goCheck\((\d+)\s*,\s*(\d+)\)").unwrap();
    static ref NON_DIGITS: Regex = Regex::new(r"\D").unwrap();
}

#[derive(Debug, Default)]
pub struct ListingPage {
    pub records: Vec<MetadataRecord>,
    /// entries dropped for lack of a recoverable identifier
    pub skipped: usize,
}

fn text_of(el: Option<ElementRef>) -> String {
    el.map(|e| e.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

fn parse_entry(li: ElementRef) -> Option<MetadataRecord> {
    let link = li.select(&HEADLINE).next()?;
    let caps = GO_CHECK.captures(link.value().attr("onclick")?)?;

    let views = li
        .select(&INFO_SPANS)
        .nth(1)
        .map(|s| NON_DIGITS.replace_all(&s.text().collect::<String>(), "").into_owned())
        .unwrap_or_default();

    Some(MetadataRecord {
        id: caps[1].to_string(),
        display_index: text_of(li.select(&NUM).next()),
        title: text_of(Some(link)),
        date: text_of(li.select(&DATE).next()),
        view_count: views,
        visibility_flag: caps[2].to_string(),
    })
}

/// Extracts every listing entry that carries an identifier.
pub fn parse_listing(html: &str) -> ListingPage {
    let doc = Html::parse_document(html);
    let mut page = ListingPage::default();
    for li in doc.select(&ENTRY) {
        match parse_entry(li) {
            Some(record) => page.records.push(record),
            None => page.skipped += 1,
        }
    }
    page
}

pub fn page_intent(page_no: u32) -> NavigationIntent {
    NavigationIntent::new(LIST_FORM, BOARD_LIST_PATH).field("pageNo", page_no)
}

pub fn detail_intent(record_id: &str) -> NavigationIntent {
    NavigationIntent::new(LIST_FORM, BOARD_VIEW_PATH)
        .field("seq", record_id)
        .field("boardSecret", PUBLIC_BOARD_SECRET)
}

/// Back to the listing from a detail view, keeping the form state.
pub fn back_to_listing_intent() -> NavigationIntent {
    NavigationIntent::new(LIST_FORM, BOARD_LIST_PATH)
}

/// Submits `intent` and waits for the resulting page to settle.
pub async fn navigate<P: InteractivePage>(
    page: &P,
    intent: &NavigationIntent,
    pacing: &Pacing,
) -> Result<(), CrawlerError> {
    page.submit_form(intent).await?;
    page.wait_for_network_idle().await?;
    sleep(pacing.navigation_settle).await;
    Ok(())
}

/// Loads the listing root, which also (re)creates the server-side session.
pub async fn open_listing<P: InteractivePage>(
    page: &P,
    list_url: &str,
    pacing: &Pacing,
) -> Result<(), CrawlerError> {
    page.goto(list_url).await?;
    if let Err(e) = page
        .wait_for_selector(PAGINATION_SELECTOR, pacing.pagination_wait)
        .await
    {
        debug!("pagination not rendered yet: {}", e);
    }
    sleep(pacing.settle).await;
    dismiss_popups(page).await;
    Ok(())
}

async fn dismiss_popups<P: InteractivePage>(page: &P) {
    for selector in POPUP_CLOSE_SELECTORS {
        if let Ok(Some(_)) = page.query_text(selector).await {
            match page.click(selector).await {
                Ok(_) => {
                    debug!("closed popup {}", selector);
                    sleep(Duration::from_millis(300)).await;
                }
                Err(e) => debug!("could not close popup {}: {}", selector, e),
            }
        }
    }
}

/// Throws the current listing state away and starts over from the root.
/// Failure is logged, the caller carries on with its next unit of work.
pub async fn reestablish_session<P: InteractivePage>(page: &P, list_url: &str, pacing: &Pacing) {
    let retry_strategy = FixedInterval::new(pacing.settle).take(1);
    let res = Retry::spawn(retry_strategy, || page.goto(list_url)).await;
    match res {
        Ok(_) => sleep(pacing.settle).await,
        Err(e) => error!("could not re-establish listing session: {}", e),
    }
}
