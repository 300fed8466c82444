//! Transactional backend
//!
//! The record log runs on a dedicated worker thread. Callers submit a
//! request over a channel and wait for the reply, bounded by the
//! configured backend timeout; a worker that does not answer in time
//! yields `BackendTimeout` instead of hanging the caller.

mod log;

use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::entry::StoredEntry;
use crate::error::{Result, StashError};

use super::{BackendAdapter, BackendKind, Usage};

pub use self::log::{LogOp, LogRecord, LogStore, RecoveryResult, HEADER_SIZE};

/// Work items understood by the worker
enum Request {
    Store { key: String, entry: Vec<u8> },
    Fetch { key: String },
    Remove { key: String },
    Clear,
    ListKeys,
    Usage,
    Compact,
    Stall(Duration),
}

enum Reply {
    Done,
    Entry(Option<Vec<u8>>),
    Keys(Vec<String>),
    Usage(Usage),
}

enum Command {
    Run {
        request: Request,
        reply: Sender<Result<Reply>>,
    },
    Shutdown,
}

/// Handle on the worker-driven record log
pub struct TransactionalStore {
    sender: Sender<Command>,
    timeout: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
    recovery: RecoveryResult,
}

impl TransactionalStore {
    /// Open the log under `dir` and start its worker
    ///
    /// The log is opened (and recovered) on the calling thread so that an
    /// unusable medium is reported before any request is accepted.
    pub fn open(dir: &Path, quota: Option<u64>, timeout: Duration) -> Result<Self> {
        let (store, recovery) = LogStore::open(dir, quota)?;
        let (sender, receiver) = channel::unbounded::<Command>();

        let worker = thread::Builder::new()
            .name("stashkv-log".to_string())
            .spawn(move || {
                let mut store = store;
                while let Ok(command) = receiver.recv() {
                    match command {
                        Command::Run { request, reply } => {
                            let result = handle(&mut store, request);
                            // The caller may have timed out and gone away
                            let _ = reply.send(result);
                        }
                        Command::Shutdown => break,
                    }
                }
                tracing::debug!("Log worker stopped");
            })?;

        Ok(Self {
            sender,
            timeout,
            worker: Mutex::new(Some(worker)),
            recovery,
        })
    }

    /// What replaying the log found on open
    pub fn recovery(&self) -> &RecoveryResult {
        &self.recovery
    }

    /// Rewrite the log down to its live records
    pub fn compact(&self) -> Result<()> {
        self.call(Request::Compact).map(|_| ())
    }

    /// Occupy the worker for `duration` without waiting for it
    ///
    /// Requests issued meanwhile queue up behind the stall, which is how
    /// a slow medium presents itself to callers.
    pub fn stall_for(&self, duration: Duration) -> Result<()> {
        let (reply, _ignored) = channel::bounded(1);
        self.sender
            .send(Command::Run {
                request: Request::Stall(duration),
                reply,
            })
            .map_err(|_| StashError::BackendUnavailable(BackendKind::Transactional))
    }

    fn call(&self, request: Request) -> Result<Reply> {
        let (reply_tx, reply_rx) = channel::bounded(1);
        self.sender
            .send(Command::Run {
                request,
                reply: reply_tx,
            })
            .map_err(|_| StashError::BackendUnavailable(BackendKind::Transactional))?;

        match reply_rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!("Log worker did not answer within {:?}", self.timeout);
                Err(StashError::BackendTimeout(BackendKind::Transactional))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(StashError::BackendUnavailable(BackendKind::Transactional))
            }
        }
    }
}

fn handle(store: &mut LogStore, request: Request) -> Result<Reply> {
    match request {
        Request::Store { key, entry } => store.put(&key, entry).map(|_| Reply::Done),
        Request::Fetch { key } => Ok(Reply::Entry(store.get(&key).map(<[u8]>::to_vec))),
        Request::Remove { key } => store.delete(&key).map(|_| Reply::Done),
        Request::Clear => store.clear().map(|_| Reply::Done),
        Request::ListKeys => Ok(Reply::Keys(store.keys())),
        Request::Usage => Ok(Reply::Usage(store.usage())),
        Request::Compact => store.compact().map(|_| Reply::Done),
        Request::Stall(duration) => {
            thread::sleep(duration);
            Ok(Reply::Done)
        }
    }
}

fn unexpected() -> StashError {
    StashError::Storage("Log worker sent an unexpected reply".to_string())
}

impl BackendAdapter for TransactionalStore {
    fn store(&self, key: &str, entry: &StoredEntry) -> Result<()> {
        let entry = serde_json::to_vec(entry)?;
        match self.call(Request::Store {
            key: key.to_string(),
            entry,
        })? {
            Reply::Done => Ok(()),
            _ => Err(unexpected()),
        }
    }

    fn fetch(&self, key: &str) -> Result<Option<StoredEntry>> {
        match self.call(Request::Fetch {
            key: key.to_string(),
        })? {
            Reply::Entry(Some(bytes)) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Reply::Entry(None) => Ok(None),
            _ => Err(unexpected()),
        }
    }

    fn remove(&self, key: &str) -> Result<()> {
        match self.call(Request::Remove {
            key: key.to_string(),
        })? {
            Reply::Done => Ok(()),
            _ => Err(unexpected()),
        }
    }

    fn clear(&self) -> Result<()> {
        match self.call(Request::Clear)? {
            Reply::Done => Ok(()),
            _ => Err(unexpected()),
        }
    }

    fn list_keys(&self) -> Result<Vec<String>> {
        match self.call(Request::ListKeys)? {
            Reply::Keys(keys) => Ok(keys),
            _ => Err(unexpected()),
        }
    }

    fn measure_usage(&self) -> Result<Usage> {
        match self.call(Request::Usage)? {
            Reply::Usage(usage) => Ok(usage),
            _ => Err(unexpected()),
        }
    }
}

impl Drop for TransactionalStore {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}
