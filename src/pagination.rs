//! Page count discovery for the listing.
//!
//! The listing markup has no single reliable signal for the last page, so a
//! chain of independent extractors is tried in priority order and the first
//! one that finds something wins.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

const LAST_PAGE_LABEL: &str = "끝";

lazy_static! {
    static ref PAGE_CALL: Regex = Regex::new(r"goList\((\d+)\)").unwrap();
    static ref HREF_PAGE_CALL: Regex = Regex::new(r"^\s*javascript:\s*goList\((\d+)\)").unwrap();
    static ref TAGS: Regex = Regex::new(r"<[^>]*>").unwrap();
    static ref TOTAL_COUNT: Regex = Regex::new(r"총[^\d<]{0,20}?(\d[\d,]*)\s*건").unwrap();
    static ref ANCHORS: Selector = Selector::parse("a").unwrap();
    static ref TERMINAL: Selector = Selector::parse(".last").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageBounds {
    pub max_page: u32,
    pub total_count: u64,
}

type Extractor = fn(&Html, &str) -> Option<u32>;

/// Extractors in priority order.
pub const STRATEGIES: [(&str, Extractor); 4] = [
    ("last-page control", last_page_control),
    ("terminal element", terminal_element),
    ("navigation links", navigation_links),
    ("page calls", any_page_call),
];

/// Page argument of a `goList(n)` call in `text`.
pub fn page_argument(text: &str) -> Option<u32> {
    PAGE_CALL
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn element_page_argument(el: &ElementRef) -> Option<u32> {
    let value = el.value();
    value
        .attr("href")
        .and_then(page_argument)
        .or_else(|| value.attr("onclick").and_then(page_argument))
}

fn last_page_control(doc: &Html, _: &str) -> Option<u32> {
    doc.select(&ANCHORS)
        .filter(|a| {
            let text = a.text().collect::<String>();
            text.contains(LAST_PAGE_LABEL)
                || a.value()
                    .attr("title")
                    .map_or(false, |t| t.contains(LAST_PAGE_LABEL))
        })
        .find_map(|a| element_page_argument(&a))
}

fn terminal_element(doc: &Html, _: &str) -> Option<u32> {
    doc.select(&TERMINAL).find_map(|el| {
        element_page_argument(&el).or_else(|| {
            // the class may sit on a wrapper around the actual link
            el.select(&ANCHORS).find_map(|a| element_page_argument(&a))
        })
    })
}

fn navigation_links(doc: &Html, _: &str) -> Option<u32> {
    doc.select(&ANCHORS)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| {
            HREF_PAGE_CALL
                .captures(href)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse().ok())
        })
        .max()
}

fn any_page_call(_: &Html, raw: &str) -> Option<u32> {
    PAGE_CALL
        .captures_iter(raw)
        .filter_map(|c| c.get(1))
        .filter_map(|m| m.as_str().parse().ok())
        .max()
}

/// Highest listing page, defaulting to 1 when no extractor finds anything.
pub fn max_page(html: &str) -> u32 {
    let doc = Html::parse_document(html);
    for (name, extractor) in STRATEGIES.iter() {
        if let Some(page) = extractor(&doc, html) {
            debug!("max page {} found by {}", page, name);
            return page;
        }
    }
    1
}

/// Total record count from the "총 N건" phrase, 0 when absent.
pub fn total_count(html: &str) -> u64 {
    let text = TAGS.replace_all(html, "");
    TOTAL_COUNT
        .captures(&text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().replace(',', "").parse().ok())
        .unwrap_or(0)
}

pub fn discover(html: &str) -> PageBounds {
    PageBounds {
        max_page: max_page(html),
        total_count: total_count(html),
    }
}
