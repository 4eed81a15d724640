//! File ingress watcher
//!
//! Polls a glob pattern and emits a `file_event` envelope for each file
//! whose content has not been seen before. Seen digests live in a bounded
//! LRU set, so a long-running watcher cannot grow without limit;
//! persistence of the set across restarts is a host concern.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::domain_types::DigestSetCapacity;
use crate::envelope::{Envelope, FILE_EVENT_MESSAGE_TYPE};

/// What to do with a file once its event has been dispatched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostDispatch {
    /// Leave the file in place.
    Keep,
    /// Delete the file.
    Delete,
    /// Move the file into the given directory.
    MoveTo(PathBuf),
}

/// Bounded set of seen digests with LRU eviction
#[derive(Debug)]
pub struct DigestSet {
    entries: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DigestSet {
    #[must_use]
    pub fn new(capacity: DigestSetCapacity) -> Self {
        Self {
            entries: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.as_usize(),
        }
    }

    /// Inserts the digest, returning `true` when it was not present
    ///
    /// Evicts the oldest entry once the bound is reached.
    pub fn insert_if_unseen(&mut self, digest: String) -> bool {
        if self.entries.contains(&digest) {
            return false;
        }
        if self.entries.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
        self.order.push_back(digest.clone());
        self.entries.insert(digest);
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Poll-based glob watcher feeding an agent's ingress
pub struct FileWatcher {
    source_id: String,
    pattern: String,
    poll_interval: Duration,
    post_dispatch: PostDispatch,
    digest_capacity: DigestSetCapacity,
    channel_capacity: usize,
}

impl FileWatcher {
    /// Creates a watcher for the given glob pattern
    #[must_use]
    pub fn new(
        source_id: impl Into<String>,
        pattern: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            pattern: pattern.into(),
            poll_interval,
            post_dispatch: PostDispatch::Keep,
            digest_capacity: DigestSetCapacity::default(),
            channel_capacity: 256,
        }
    }

    /// Sets the action applied to files after successful dispatch
    #[must_use]
    pub fn with_post_dispatch(mut self, post_dispatch: PostDispatch) -> Self {
        self.post_dispatch = post_dispatch;
        self
    }

    /// Overrides the seen-digest bound
    #[must_use]
    pub fn with_digest_capacity(mut self, capacity: DigestSetCapacity) -> Self {
        self.digest_capacity = capacity;
        self
    }

    /// Starts polling, returning the event stream and the poller task
    #[must_use]
    pub fn spawn(
        self,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<Envelope>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let handle = tokio::spawn(self.run(tx, cancel));
        (rx, handle)
    }

    async fn run(self, tx: mpsc::Sender<Envelope>, cancel: CancellationToken) {
        let mut seen = DigestSet::new(self.digest_capacity);
        debug!(
            source = %self.source_id,
            pattern = %self.pattern,
            "file watcher started"
        );
        loop {
            if !self.poll_once(&mut seen, &tx).await {
                break;
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        debug!(source = %self.source_id, "file watcher stopped");
    }

    /// One enumeration pass; returns `false` once the consumer is gone
    async fn poll_once(&self, seen: &mut DigestSet, tx: &mpsc::Sender<Envelope>) -> bool {
        let paths = match glob::glob(&self.pattern) {
            Ok(paths) => paths,
            Err(error) => {
                warn!(pattern = %self.pattern, %error, "glob enumeration failed");
                return true;
            }
        };

        for path in paths.flatten() {
            if !path.is_file() {
                continue;
            }
            let contents = match tokio::fs::read(&path).await {
                Ok(contents) => contents,
                Err(error) => {
                    warn!(path = %path.display(), %error, "failed to read watched file");
                    continue;
                }
            };
            let digest = content_digest(&path, &contents);
            if !seen.insert_if_unseen(digest.clone()) {
                trace!(path = %path.display(), "already seen, skipping");
                continue;
            }

            let envelope = Envelope::new(
                self.source_id.clone(),
                self.source_id.clone(),
                FILE_EVENT_MESSAGE_TYPE,
                path.display().to_string().into_bytes(),
            )
            .with_header("X-File-Digest", digest)
            .with_property("size", serde_json::json!(contents.len()));

            if tx.send(envelope).await.is_err() {
                return false;
            }
            debug!(path = %path.display(), "file event emitted");
            self.after_dispatch(&path).await;
        }
        true
    }

    async fn after_dispatch(&self, path: &Path) {
        match &self.post_dispatch {
            PostDispatch::Keep => {}
            PostDispatch::Delete => {
                if let Err(error) = tokio::fs::remove_file(path).await {
                    warn!(path = %path.display(), %error, "failed to delete dispatched file");
                }
            }
            PostDispatch::MoveTo(directory) => {
                let target = match path.file_name() {
                    Some(name) => directory.join(name),
                    None => return,
                };
                if let Err(error) = tokio::fs::create_dir_all(directory).await {
                    warn!(directory = %directory.display(), %error, "failed to create move target");
                    return;
                }
                if let Err(error) = tokio::fs::rename(path, &target).await {
                    warn!(path = %path.display(), %error, "failed to move dispatched file");
                }
            }
        }
    }
}

/// Content digest keyed by path and bytes
///
/// Including the path lets two files with identical content each emit one
/// event, while edits to a file re-emit it.
fn content_digest(path: &Path, contents: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.display().to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(contents);
    format!("{:x}", hasher.finalize())
}
