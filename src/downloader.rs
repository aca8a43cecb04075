use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    browser_controller::InteractivePage,
    types::{CrawlerError, DownloadResult, DownloadTrigger, FileDescriptor},
    utils::{destination_path, file_size, BOARD_TYPE, DOWNLOAD_ALL_SELECTOR, FILE_DOWNLOAD_PATH},
};

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub download_dir: PathBuf,
    pub board_type: String,
    pub primary_selector: String,
    pub fallback_path: String,
    pub timeout: Duration,
}

impl DownloadSettings {
    pub fn new(download_dir: PathBuf) -> Self {
        DownloadSettings {
            download_dir,
            board_type: BOARD_TYPE.into(),
            primary_selector: DOWNLOAD_ALL_SELECTOR.into(),
            fallback_path: FILE_DOWNLOAD_PATH.into(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Raw file endpoint for one attachment.
pub fn fallback_url(settings: &DownloadSettings, file: &FileDescriptor) -> String {
    format!(
        "{}?seq={}&boardType={}&file_num={}",
        settings.fallback_path,
        urlencoding::encode(&file.owning_record_id),
        urlencoding::encode(&settings.board_type),
        file.file_sequence
    )
}

/// Moves a staged artifact to its final place. Zero-byte artifacts are
/// discarded and reported as a failure.
fn persist(staged: &Path, dest: &Path) -> Result<PathBuf, CrawlerError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(staged, dest).is_err() {
        // staging may live on another device
        fs::copy(staged, dest)?;
        fs::remove_file(staged)?;
    }
    match file_size(dest) {
        Some(size) if size > 0 => Ok(dest.to_path_buf()),
        _ => {
            let _ = fs::remove_file(dest);
            Err(CrawlerError::Download(format!("{:?} is empty", dest)))
        }
    }
}

/// Materializes attachments of the detail view currently open in `page`.
pub struct DownloadOrchestrator<'a, P> {
    page: &'a P,
    settings: DownloadSettings,
}

impl<'a, P: InteractivePage> DownloadOrchestrator<'a, P> {
    pub fn new(page: &'a P, settings: DownloadSettings) -> Self {
        DownloadOrchestrator { page, settings }
    }

    pub fn destination(&self, file: &FileDescriptor) -> PathBuf {
        destination_path(
            &self.settings.download_dir,
            &file.owning_record_id,
            file.file_sequence,
            &file.file_name,
        )
    }

    async fn attempt(&self, trigger: &DownloadTrigger, dest: &Path) -> Result<PathBuf, CrawlerError> {
        let staged = self
            .page
            .await_download(trigger, self.settings.timeout)
            .await?;
        persist(&staged, dest)
    }

    /// Existing non-empty files short-circuit without touching the page;
    /// otherwise the download-all control is tried, then the raw endpoint.
    pub async fn materialize(&self, file: &FileDescriptor) -> DownloadResult {
        let dest = self.destination(file);

        if let Some(size) = file_size(&dest) {
            if size > 0 {
                debug!("{:?} already present, skipping", dest);
                return DownloadResult::Materialized(dest);
            }
            debug!("{:?} is empty, downloading again", dest);
        }

        let primary = DownloadTrigger::Click(self.settings.primary_selector.clone());
        match self.attempt(&primary, &dest).await {
            Ok(path) => return DownloadResult::Materialized(path),
            Err(e) => warn!(
                "primary download of {} failed: {}, trying raw endpoint",
                file.file_name, e
            ),
        }

        let fallback = DownloadTrigger::SyntheticLink(fallback_url(&self.settings, file));
        match self.attempt(&fallback, &dest).await {
            Ok(path) => DownloadResult::Materialized(path),
            Err(e) => {
                error!(
                    "download of {} for record {} failed: {}",
                    file.file_name, file.owning_record_id, e
                );
                DownloadResult::Failed
            }
        }
    }

    /// Materializes `files` in order, one result per file.
    pub async fn materialize_all(&self, files: &[FileDescriptor]) -> Vec<DownloadResult> {
        let mut results = Vec::with_capacity(files.len());
        for file in files {
            results.push(self.materialize(file).await);
        }
        results
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fallback_url_carries_record_board_and_sequence() {
        let settings = DownloadSettings::new(PathBuf::from("d"));
        let file = FileDescriptor {
            file_name: "a.pdf".into(),
            file_sequence: 3,
            owning_record_id: "128980".into(),
        };
        assert_eq!(
            fallback_url(&settings, &file),
            "/board/getFileDownload.do?seq=128980&boardType=15&file_num=3"
        );
    }

    #[test]
    fn persist_rejects_empty_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("staged");
        fs::write(&staged, b"").unwrap();
        let dest = dir.path().join("out/final");
        assert!(persist(&staged, &dest).is_err());
        assert!(!dest.exists());

        fs::write(&staged, b"data").unwrap();
        assert_eq!(persist(&staged, &dest).unwrap(), dest);
        assert!(!staged.exists());
    }
}
