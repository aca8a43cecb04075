use std::{
    collections::{BTreeSet, HashSet, VecDeque},
    fs,
    marker::PhantomData,
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::types::{CrawlerError, MetadataRecord};

/// Metadata phase progress, persisted as `{"last_page": n}`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataCheckpoint {
    #[serde(default)]
    pub last_page: u32,
}

impl MetadataCheckpoint {
    /// Moves the marker forward. Never moves it back.
    pub fn advance(&mut self, page: u32) -> bool {
        if page > self.last_page {
            self.last_page = page;
            return true;
        }
        false
    }
}

/// Crawl phase progress, persisted as `{"done_ids": [..]}`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlCheckpoint {
    #[serde(default)]
    pub done_ids: BTreeSet<String>,
}

/// A JSON document on disk, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct CheckpointStore<T> {
    path: PathBuf,
    _state: PhantomData<T>,
}

impl<T> CheckpointStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CheckpointStore {
            path: path.into(),
            _state: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the persisted state, or the default when nothing was saved yet.
    pub fn load(&self) -> Result<T, CrawlerError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&raw).map_err(|e| CrawlerError::Checkpoint {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    pub fn save(&self, state: &T) -> Result<(), CrawlerError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, serde_json::to_vec(state)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Durable queue of records still to crawl.
///
/// A record popped with [`RecordQueue::next`] only leaves the durable set once
/// [`RecordQueue::complete`] is called for it; a record that fails is simply
/// not completed and stays pending for the next run.
pub struct RecordQueue {
    store: CheckpointStore<CrawlCheckpoint>,
    state: CrawlCheckpoint,
    pending: VecDeque<MetadataRecord>,
    total: usize,
    flush_every: usize,
    unflushed: usize,
}

impl RecordQueue {
    pub fn open(
        store: CheckpointStore<CrawlCheckpoint>,
        records: Vec<MetadataRecord>,
        flush_every: usize,
    ) -> Result<Self, CrawlerError> {
        let state = store.load()?;
        // a shifting listing can repeat an entry across pages
        let mut seen = HashSet::new();
        let public = records
            .into_iter()
            .filter(MetadataRecord::is_public)
            .filter(|r| seen.insert(r.id.clone()))
            .collect::<Vec<_>>();
        let total = public.len();
        let pending = public
            .into_iter()
            .filter(|r| !state.done_ids.contains(&r.id))
            .collect();

        Ok(RecordQueue {
            store,
            state,
            pending,
            total,
            flush_every: flush_every.max(1),
            unflushed: 0,
        })
    }

    pub fn next(&mut self) -> Option<MetadataRecord> {
        self.pending.pop_front()
    }

    /// Marks `id` done. Returns true when this call persisted the checkpoint.
    pub fn complete(&mut self, id: &str) -> Result<bool, CrawlerError> {
        if !self.state.done_ids.insert(id.to_string()) {
            return Ok(false);
        }
        self.unflushed += 1;
        if self.unflushed >= self.flush_every {
            self.flush()?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn flush(&mut self) -> Result<(), CrawlerError> {
        self.store.save(&self.state)?;
        self.unflushed = 0;
        Ok(())
    }

    pub fn is_done(&self, id: &str) -> bool {
        self.state.done_ids.contains(id)
    }

    pub fn done_count(&self) -> usize {
        self.state.done_ids.len()
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    pub fn total(&self) -> usize {
        self.total
    }
}
