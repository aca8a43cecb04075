//! Turns downloaded attachments into plain tables.
//!
//! Formats that can't be read here are left untouched on disk and counted as
//! skipped.

use calamine::{open_workbook_auto, Reader};
use regex::Regex;
use std::{
    fs::{self, File},
    io::Read,
    path::{Path, PathBuf},
};

use crate::{
    table::{read_table, write_rows},
    types::{CrawlResultRecord, CrawlerError, DownloadOutcome, PhaseSummary},
    utils::{file_sequence_of, split_joined},
};

pub type Rows = Vec<Vec<String>>;

lazy_static! {
    static ref DOCX_ROW: Regex = Regex::new(r"(?s)<w:tr[ >].*?</w:tr>").unwrap();
    static ref DOCX_CELL: Regex = Regex::new(r"(?s)<w:tc[ >].*?</w:tc>").unwrap();
    static ref DOCX_PARAGRAPH: Regex = Regex::new(r"(?s)<w:p[ >].*?</w:p>").unwrap();
    static ref DOCX_TEXT: Regex = Regex::new(r"(?s)<w:t(?: [^>]*)?>(.*?)</w:t>").unwrap();
    static ref DRAWING_PARAGRAPH: Regex = Regex::new(r"(?s)<a:p>.*?</a:p>").unwrap();
    static ref DRAWING_TEXT: Regex = Regex::new(r"(?s)<a:t>(.*?)</a:t>").unwrap();
    static ref HWPX_PARAGRAPH: Regex = Regex::new(r"(?s)<hp:p[ >].*?</hp:p>").unwrap();
    static ref HWPX_TEXT: Regex = Regex::new(r"(?s)<hp:t(?: [^>]*)?>(.*?)</hp:t>").unwrap();
    static ref SLIDE_NAME: Regex = Regex::new(r"^ppt/slides/slide(\d+)\.xml$").unwrap();
    static ref SECTION_NAME: Regex = Regex::new(r"^Contents/section(\d+)\.xml$").unwrap();
}

/// `convert(file) -> rows-or-none`
pub trait Converter {
    fn convert(&self, path: &Path) -> Option<Rows>;
}

/// Picks a conversion routine from the file extension.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConversionDispatcher;

impl Converter for ConversionDispatcher {
    fn convert(&self, path: &Path) -> Option<Rows> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();

        let res = match ext.as_str() {
            "xlsx" | "xlsm" | "xls" | "xlsb" | "ods" => convert_spreadsheet(path),
            "docx" => convert_docx(path),
            "pptx" => convert_pptx(path),
            "hwpx" => convert_hwpx(path),
            "hwp" => convert_hwp(path),
            "pdf" => convert_pdf(path),
            "txt" => convert_text(path),
            "csv" => convert_csv(path),
            _ => {
                debug!("no converter for {:?}", path);
                return None;
            }
        };

        match res {
            Ok(rows) if !rows.is_empty() => Some(pad(rows)),
            Ok(_) => None,
            Err(e) => {
                warn!("could not convert {:?}: {:#}", path, e);
                None
            }
        }
    }
}

fn pad(mut rows: Rows) -> Rows {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    for row in rows.iter_mut() {
        row.resize(width, String::new());
    }
    rows
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn texts(fragment: &str, pattern: &Regex) -> String {
    pattern
        .captures_iter(fragment)
        .filter_map(|c| c.get(1))
        .map(|m| unescape_xml(m.as_str()))
        .collect::<String>()
        .trim()
        .to_string()
}

fn lines(text: &str) -> Rows {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| vec![l.to_string()])
        .collect()
}

fn zip_entry(archive: &mut zip::ZipArchive<File>, name: &str) -> anyhow::Result<String> {
    let mut entry = archive.by_name(name)?;
    let mut xml = String::new();
    entry.read_to_string(&mut xml)?;
    Ok(xml)
}

/// Entries matching `pattern`, ordered by their numeric capture.
fn numbered_entries(archive: &zip::ZipArchive<File>, pattern: &Regex) -> Vec<(u32, String)> {
    let mut entries = archive
        .file_names()
        .filter_map(|name| {
            let n = pattern.captures(name)?.get(1)?.as_str().parse().ok()?;
            Some((n, name.to_string()))
        })
        .collect::<Vec<_>>();
    entries.sort();
    entries
}

fn convert_spreadsheet(path: &Path) -> anyhow::Result<Rows> {
    let mut workbook = open_workbook_auto(path)?;
    let mut rows = vec![];
    for sheet in workbook.sheet_names().to_owned() {
        let range = match workbook.worksheet_range(&sheet) {
            Ok(range) => range,
            Err(e) => {
                warn!("skipping sheet {} of {:?}: {}", sheet, path, e);
                continue;
            }
        };
        for row in range.rows() {
            let mut out = vec![sheet.clone()];
            out.extend(row.iter().map(|cell| cell.to_string()));
            rows.push(out);
        }
    }
    Ok(rows)
}

fn convert_docx(path: &Path) -> anyhow::Result<Rows> {
    let mut archive = zip::ZipArchive::new(File::open(path)?)?;
    let xml = zip_entry(&mut archive, "word/document.xml")?;

    let tables = DOCX_ROW
        .find_iter(&xml)
        .map(|row| {
            DOCX_CELL
                .find_iter(row.as_str())
                .map(|cell| texts(cell.as_str(), &DOCX_TEXT))
                .collect::<Vec<_>>()
        })
        .collect::<Rows>();
    if !tables.is_empty() {
        return Ok(tables);
    }

    Ok(DOCX_PARAGRAPH
        .find_iter(&xml)
        .map(|p| texts(p.as_str(), &DOCX_TEXT))
        .filter(|t| !t.is_empty())
        .map(|t| vec![t])
        .collect())
}

fn convert_pptx(path: &Path) -> anyhow::Result<Rows> {
    let mut archive = zip::ZipArchive::new(File::open(path)?)?;
    let mut rows = vec![];
    for (n, name) in numbered_entries(&archive, &SLIDE_NAME) {
        let xml = zip_entry(&mut archive, &name)?;
        for p in DRAWING_PARAGRAPH.find_iter(&xml) {
            let text = texts(p.as_str(), &DRAWING_TEXT);
            if !text.is_empty() {
                rows.push(vec![format!("slide_{}", n), text]);
            }
        }
    }
    Ok(rows)
}

fn convert_hwpx(path: &Path) -> anyhow::Result<Rows> {
    let mut archive = zip::ZipArchive::new(File::open(path)?)?;
    let mut rows = vec![];
    for (_, name) in numbered_entries(&archive, &SECTION_NAME) {
        let xml = zip_entry(&mut archive, &name)?;
        for p in HWPX_PARAGRAPH.find_iter(&xml) {
            let text = texts(p.as_str(), &HWPX_TEXT);
            if !text.is_empty() {
                rows.push(vec![text]);
            }
        }
    }
    Ok(rows)
}

/// Legacy HWP is an OLE container. Only its plain-text preview stream is read,
/// which is UTF-16LE.
fn convert_hwp(path: &Path) -> anyhow::Result<Rows> {
    let mut container = cfb::open(path)?;
    let mut bytes = vec![];
    container.open_stream("/PrvText")?.read_to_end(&mut bytes)?;
    let (text, _) = encoding_rs::UTF_16LE.decode_without_bom_handling(&bytes);
    Ok(lines(&text))
}

/// Text of every page, one row per line.
fn convert_pdf(path: &Path) -> anyhow::Result<Rows> {
    // the extractor panics on some malformed documents
    let text = std::panic::catch_unwind(|| pdf_extract::extract_text(path))
        .map_err(|_| anyhow::anyhow!("pdf extractor panicked"))?
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    Ok(lines(&text))
}

/// UTF-8 first, then the legacy korean code page.
fn decode_text(bytes: &[u8]) -> Option<String> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    if let Ok(text) = std::str::from_utf8(bytes) {
        return Some(text.to_string());
    }
    encoding_rs::EUC_KR
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(|text| text.into_owned())
}

fn convert_text(path: &Path) -> anyhow::Result<Rows> {
    let bytes = fs::read(path)?;
    let text = decode_text(&bytes)
        .ok_or_else(|| anyhow::anyhow!("unknown text encoding in {:?}", path))?;
    Ok(lines(&text))
}

fn convert_csv(path: &Path) -> anyhow::Result<Rows> {
    let bytes = fs::read(path)?;
    let text = decode_text(&bytes)
        .ok_or_else(|| anyhow::anyhow!("unknown text encoding in {:?}", path))?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    let mut rows = vec![];
    for record in reader.records() {
        rows.push(record?.iter().map(String::from).collect());
    }
    Ok(rows)
}

const PREFIX_COLUMNS: [&str; 5] = ["_seq", "_apt_name", "_title", "_date", "_file_name"];

/// Converts every materialized file of every `OK` result row into
/// `<parsed_dir>/<record>_<file seq>.csv`.
pub fn parse_results<C: Converter>(
    converter: &C,
    result_table: &Path,
    parsed_dir: &Path,
) -> Result<PhaseSummary, CrawlerError> {
    let rows: Vec<CrawlResultRecord> = read_table(result_table)?;
    let targets = rows
        .iter()
        .filter(|r| r.outcome == DownloadOutcome::Ok)
        .collect::<Vec<_>>();
    info!("{} result rows to convert", targets.len());

    fs::create_dir_all(parsed_dir)?;
    let mut summary = PhaseSummary {
        output: parsed_dir.to_path_buf(),
        ..Default::default()
    };

    for row in targets {
        let names = split_joined(&row.file_names);
        for (i, path) in split_joined(&row.file_paths).into_iter().enumerate() {
            if path.is_empty() {
                continue;
            }
            let path = PathBuf::from(path);
            if !path.exists() {
                debug!("{:?} is gone, skipping", path);
                continue;
            }

            let table = match converter.convert(&path) {
                Some(table) => table,
                None => {
                    summary.skipped += 1;
                    info!("kept original {:?}, not convertible", path);
                    continue;
                }
            };

            let file_seq = file_sequence_of(&path).unwrap_or(i as u32 + 1);
            let file_name = names.get(i).cloned().unwrap_or_default();
            let prefix = [
                row.id.clone(),
                row.derived_entity_name.clone(),
                row.title.clone(),
                row.date.clone(),
                file_name,
            ];
            let out_rows = table
                .into_iter()
                .map(|cells| prefix.iter().cloned().chain(cells).collect())
                .collect::<Rows>();

            let header = PREFIX_COLUMNS.iter().map(|s| s.to_string()).collect::<Vec<_>>();
            let out = parsed_dir.join(format!("{}_{}.csv", row.id, file_seq));
            match write_rows(&out, &header, &out_rows) {
                Ok(_) => summary.processed += 1,
                Err(e) => {
                    summary.errors += 1;
                    error!("could not write {:?}: {}", out, e);
                }
            }
        }
    }

    info!(
        "parse done: {} converted, {} kept as original -> {:?}",
        summary.processed, summary.skipped, summary.output
    );
    Ok(summary)
}
