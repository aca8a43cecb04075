use regex::Regex;
use std::path::{Path, PathBuf};

pub const BASE_URL: &str = "https://www.k-apt.go.kr";
pub const BOARD_LIST_PATH: &str = "/web/board/webRepairPlan/boardList.do";
pub const BOARD_VIEW_PATH: &str = "/web/board/webRepairPlan/boardView.do";
pub const FILE_DOWNLOAD_PATH: &str = "/board/getFileDownload.do";
pub const FILE_LIST_MARKER: &str = "fileListData.do";
pub const BOARD_TYPE: &str = "15";

pub const LIST_FORM: &str = "listForm";
pub const DOWNLOAD_ALL_SELECTOR: &str = "#btn-all-files";
pub const PAGINATION_SELECTOR: &str = "div.pagination";
pub const DETAIL_BODY_SELECTOR: &str = ".boardV_cont";
pub const POPUP_CLOSE_SELECTORS: [&str; 4] =
    [".popup_close", ".bClose", "[onclick*='closePopup']", ".close"];

pub const PUBLIC_BOARD_SECRET: &str = "0";
pub const JOIN_SEPARATOR: &str = " | ";

pub const OUTPUT_DIR: &str = "output";
pub const DOWNLOAD_DIR: &str = "downloads";
pub const STAGING_DIR: &str = ".staging";
pub const PARSED_DIR: &str = "parsed";
pub const METADATA_CSV: &str = "metadata.csv";
pub const RESULT_CSV: &str = "result.csv";
pub const META_CHECKPOINT: &str = "checkpoint_meta.json";
pub const CRAWL_CHECKPOINT: &str = "checkpoint_crawl.json";

lazy_static! {
    pub static ref HOME_DIR: PathBuf = match std::env::var("APTCRAWL_HOME") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from("."),
    };
    pub static ref HEADLESS: bool = match std::env::var("APTCRAWL_HEADLESS") {
        Ok(v) => !matches!(v.to_lowercase().as_str(), "0" | "false" | "no"),
        Err(_) => true,
    };
    static ref RESERVED_CHARS: Regex = Regex::new(r#"[<>:"/\\|?*]"#).unwrap();
}

/// Replaces filesystem-reserved characters with an underscore.
pub fn sanitize_file_name(name: &str) -> String {
    RESERVED_CHARS.replace_all(name, "_").into_owned()
}

/// `<dir>/<record>_<file seq>_<sanitized name>`
pub fn destination_path(dir: &Path, record_id: &str, file_sequence: u32, name: &str) -> PathBuf {
    dir.join(format!(
        "{}_{}_{}",
        sanitize_file_name(record_id),
        file_sequence,
        sanitize_file_name(name)
    ))
}

/// File sequence encoded in a name produced by [`destination_path`].
pub fn file_sequence_of(path: &Path) -> Option<u32> {
    path.file_name()?
        .to_str()?
        .split('_')
        .nth(1)?
        .parse()
        .ok()
}

pub fn split_joined(value: &str) -> Vec<String> {
    if value.trim().is_empty() {
        return vec![];
    }
    value.split('|').map(|s| s.trim().to_string()).collect()
}

/// Size of the file at `path`, `None` when it does not exist.
pub fn file_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path)
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.len())
}
