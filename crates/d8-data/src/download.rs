//! Recursive, bounded-concurrency download of files, directory trees and
//! block-device size reports.
//!
//! A directory download runs on a fixed pool of scoped worker threads that
//! pull jobs from a shared queue. Listing a directory queues one job per
//! entry, so the pool size bounds both the requests in flight and the
//! threads alive, however wide or deep the tree is.

use crate::http::files_url;
use crate::listing::{EntryKind, ListingDecoder};
use crate::{
    CancelToken, DownloadFailure, HttpClient, TransferError, TransferSession, VolumeMode,
    BLOCK_API,
};
use std::collections::{HashSet, VecDeque};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use tracing::{debug, info, warn};

/// Default cap on concurrent remote fetches.
pub const MAX_IN_FLIGHT: usize = 10;

enum Job {
    File { remote: String, local: PathBuf },
    Dir { remote: String, local: PathBuf },
}

struct QueueState {
    jobs: VecDeque<Job>,
    /// Jobs queued or still running; children are queued before their
    /// parent finishes, so zero means the tree is exhausted.
    pending: usize,
}

struct WorkQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl WorkQueue {
    fn new(first: Job) -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs: VecDeque::from([first]),
                pending: 1,
            }),
            ready: Condvar::new(),
        }
    }

    fn push(&self, job: Job) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.jobs.push_back(job);
        state.pending += 1;
        self.ready.notify_one();
    }

    /// Block until a job is available, or return `None` once nothing is
    /// left to run.
    fn next(&self) -> Option<Job> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(job) = state.jobs.pop_front() {
                return Some(job);
            }
            if state.pending == 0 {
                return None;
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn done(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.pending -= 1;
        if state.pending == 0 {
            self.ready.notify_all();
        }
    }
}

/// Marks the current job finished on drop, including during unwinding.
struct Finished<'a>(&'a WorkQueue);

impl Drop for Finished<'_> {
    fn drop(&mut self) {
        self.0.done();
    }
}

#[derive(Default)]
struct TallyState {
    files: usize,
    first_error: Option<TransferError>,
}

/// Files completed across the tree and the first failure seen.
#[derive(Default)]
struct Tally {
    state: Mutex<TallyState>,
}

impl Tally {
    fn file_done(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .files += 1;
    }

    fn fail(&self, error: TransferError) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.first_error.is_none() {
            state.first_error = Some(error);
        }
    }

    fn finish(self) -> Result<usize, DownloadFailure> {
        let state = self
            .state
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        match state.first_error {
            None => Ok(state.files),
            Some(error) => Err(DownloadFailure {
                downloaded: state.files,
                error,
            }),
        }
    }
}

fn failed(error: TransferError) -> DownloadFailure {
    DownloadFailure {
        downloaded: 0,
        error,
    }
}

fn join_remote(dir: &str, name: &str) -> String {
    format!("{}/{name}", dir.trim_end_matches('/'))
}

/// Format a byte count with the largest exact binary suffix (`10Gi`, `1536`).
pub fn format_binary_si(bytes: u64) -> String {
    const SUFFIXES: [&str; 6] = ["Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];
    if bytes == 0 {
        return "0".to_owned();
    }
    let mut value = bytes;
    let mut suffix = "";
    for s in SUFFIXES {
        if value % 1024 != 0 {
            break;
        }
        value /= 1024;
        suffix = s;
    }
    format!("{value}{suffix}")
}

pub struct Downloader {
    client: Arc<dyn HttpClient>,
    base_url: String,
    cancel: CancelToken,
    workers: usize,
}

impl Downloader {
    pub fn new(client: Arc<dyn HttpClient>, base_url: &str, cancel: CancelToken) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            cancel,
            workers: MAX_IN_FLIGHT,
        }
    }

    pub fn from_session(session: &TransferSession, cancel: CancelToken) -> Self {
        Self::new(Arc::clone(&session.client), &session.base_url, cancel)
    }

    /// Size of the worker pool, and so of the requests in flight.
    #[must_use]
    pub fn with_max_in_flight(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Download `remote_src` to `local_dst` and return the number of files
    /// written.
    ///
    /// - `Block` mode ignores `remote_src` and writes the device size.
    /// - A `remote_src` ending in `/` is a directory: the tree is mirrored
    ///   under `local_dst` (default `./<last segment>`).
    /// - Otherwise a single file is written to `local_dst`, or to stdout when
    ///   no destination is given.
    pub fn download(
        &self,
        remote_src: &str,
        local_dst: Option<&Path>,
        mode: VolumeMode,
    ) -> Result<usize, DownloadFailure> {
        match mode {
            VolumeMode::Block => self
                .report_block_size(local_dst)
                .map(|()| 1)
                .map_err(failed),
            VolumeMode::Filesystem if remote_src.ends_with('/') => {
                let local = match local_dst {
                    Some(path) => path.to_path_buf(),
                    None => default_dir_destination(remote_src),
                };
                fs::create_dir_all(&local).map_err(|e| failed(e.into()))?;
                info!("downloading {remote_src} into {}", local.display());
                self.fetch_dir(remote_src, &local)
            }
            VolumeMode::Filesystem => self
                .fetch_file(remote_src, local_dst)
                .map(|()| 1)
                .map_err(failed),
        }
    }

    fn report_block_size(&self, local_dst: Option<&Path>) -> Result<(), TransferError> {
        self.cancel.check()?;
        let url = format!("{}{BLOCK_API}", self.base_url);
        let resp = self.client.head(&url)?;
        if !resp.is_success() {
            return Err(TransferError::Status {
                context: format!("HEAD {BLOCK_API}"),
                status: resp.status,
                body: String::new(),
            });
        }
        let size: u64 = resp
            .header("Content-Length")
            .ok_or_else(|| {
                TransferError::Protocol("block size response has no Content-Length".to_owned())
            })?
            .trim()
            .parse()
            .map_err(|_| TransferError::Protocol("block size is not a number".to_owned()))?;
        let line = format!("{}\n", format_binary_si(size));
        match local_dst {
            Some(path) => fs::write(path, line)?,
            None => io::stdout().lock().write_all(line.as_bytes())?,
        }
        Ok(())
    }

    fn fetch_file(&self, remote: &str, local: Option<&Path>) -> Result<(), TransferError> {
        self.cancel.check()?;
        let resp = self.client.get(&files_url(&self.base_url, remote))?;
        if resp.status != 200 {
            let status = resp.status;
            return Err(TransferError::Status {
                context: format!("GET {remote}"),
                status,
                body: resp.error_body(),
            });
        }
        let mut body = resp.into_body();
        let written = match local {
            Some(path) => {
                let mut file = File::create(path)?;
                io::copy(&mut body, &mut file)?
            }
            None => {
                let mut out = io::stdout().lock();
                let n = io::copy(&mut body, &mut out)?;
                out.flush()?;
                n
            }
        };
        debug!("downloaded {remote} ({written} bytes)");
        Ok(())
    }

    fn fetch_dir(&self, remote: &str, local: &Path) -> Result<usize, DownloadFailure> {
        self.cancel.check().map_err(failed)?;
        let tally = Tally::default();
        let queue = WorkQueue::new(Job::Dir {
            remote: remote.to_owned(),
            local: local.to_path_buf(),
        });
        thread::scope(|s| {
            let mut started = 0;
            for i in 0..self.workers {
                let spawned = thread::Builder::new()
                    .name(format!("d8-download-{i}"))
                    .spawn_scoped(s, || self.work(&queue, &tally));
                match spawned {
                    Ok(_) => started += 1,
                    Err(e) => {
                        warn!("download worker {i} not started: {e}");
                        break;
                    }
                }
            }
            if started == 0 {
                self.work(&queue, &tally);
            }
        });
        tally.finish()
    }

    fn work(&self, queue: &WorkQueue, tally: &Tally) {
        while let Some(job) = queue.next() {
            let _finished = Finished(queue);
            match job {
                Job::File { remote, local } => match self.fetch_file(&remote, Some(&local)) {
                    Ok(()) => tally.file_done(),
                    Err(e) => tally.fail(e),
                },
                Job::Dir { remote, local } => {
                    if let Err(e) = self.list_dir(&remote, &local, queue, tally) {
                        tally.fail(e);
                    }
                }
            }
        }
    }

    /// Stream the listing of `remote` and queue one job per entry. Entries
    /// queued before a listing error still run.
    fn list_dir(
        &self,
        remote: &str,
        local: &Path,
        queue: &WorkQueue,
        tally: &Tally,
    ) -> Result<(), TransferError> {
        self.cancel.check()?;
        let resp = self.client.get(&files_url(&self.base_url, remote))?;
        if resp.status != 200 {
            let status = resp.status;
            return Err(TransferError::Status {
                context: format!("GET {remote}"),
                status,
                body: resp.error_body(),
            });
        }

        let mut seen = HashSet::new();
        for entry in ListingDecoder::new(resp.into_body()) {
            let entry = entry?;
            if !seen.insert(entry.name.clone()) {
                return Err(TransferError::Protocol(format!(
                    "duplicate entry {:?} in listing of {remote}",
                    entry.name
                )));
            }
            let child_local = local.join(&entry.name);
            let child_remote = join_remote(remote, &entry.name);
            match entry.kind {
                EntryKind::Dir => {
                    if let Err(e) = fs::create_dir_all(&child_local) {
                        tally.fail(e.into());
                        continue;
                    }
                    queue.push(Job::Dir {
                        remote: format!("{child_remote}/"),
                        local: child_local,
                    });
                }
                EntryKind::File => queue.push(Job::File {
                    remote: child_remote,
                    local: child_local,
                }),
                EntryKind::Other => {
                    warn!("skipping {child_remote}: unsupported entry type");
                }
            }
        }
        Ok(())
    }
}

fn default_dir_destination(remote_src: &str) -> PathBuf {
    match remote_src.trim_end_matches('/').rsplit('/').next() {
        Some(last) if !last.is_empty() => PathBuf::from(last),
        _ => PathBuf::from("."),
    }
}
