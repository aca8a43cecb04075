use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::Path,
};

use serde::{de::DeserializeOwned, Serialize};

use crate::types::CrawlerError;

const BOM: &[u8] = b"\xEF\xBB\xBF";

/// Append-only CSV sink. Every row is flushed as soon as it is written.
pub struct TableWriter {
    writer: csv::Writer<File>,
}

impl TableWriter {
    /// Opens `path` for appending when `append` is set and the file exists,
    /// otherwise (re)creates it with `header`.
    pub fn open(path: &Path, header: &[&str], append: bool) -> Result<Self, CrawlerError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let writer = if append && path.exists() {
            let file = OpenOptions::new().append(true).open(path)?;
            csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(file)
        } else {
            let mut file = File::create(path)?;
            // excel needs the BOM to pick up utf-8
            file.write_all(BOM)?;
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(file);
            writer.write_record(header)?;
            writer.flush()?;
            writer
        };

        Ok(TableWriter { writer })
    }

    pub fn append<T: Serialize>(&mut self, row: &T) -> Result<(), CrawlerError> {
        self.writer.serialize(row)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn append_all<T: Serialize>(&mut self, rows: &[T]) -> Result<(), CrawlerError> {
        for row in rows {
            self.writer.serialize(row)?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

fn strip_bom(raw: &[u8]) -> &[u8] {
    raw.strip_prefix(BOM).unwrap_or(raw)
}

/// Reads every row of a headed table.
pub fn read_table<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, CrawlerError> {
    if !path.exists() {
        return Err(CrawlerError::MissingInput(path.to_path_buf()));
    }
    let raw = fs::read(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(strip_bom(&raw));
    let mut rows = vec![];
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

/// Writes an untyped table, padding every row to the widest one.
pub fn write_rows(path: &Path, header: &[String], rows: &[Vec<String>]) -> Result<(), CrawlerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let width = rows
        .iter()
        .map(Vec::len)
        .chain(std::iter::once(header.len()))
        .max()
        .unwrap_or(0);

    let mut file = File::create(path)?;
    file.write_all(BOM)?;
    let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(file);

    let mut head = header.to_vec();
    head.extend((header.len()..width).map(|i| i.to_string()));
    writer.write_record(&head)?;
    for row in rows {
        let mut padded = row.clone();
        padded.resize(width, String::new());
        writer.write_record(&padded)?;
    }
    writer.flush()?;
    Ok(())
}
