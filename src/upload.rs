//! Chunked upload sessions.
//!
//! A session accumulates chunks into a temp file under the upload directory.
//! Chunks are appended in arrival order; the index is only recorded, never
//! used to position bytes, so clients must send chunks sequentially.
//!
//! Re-sending an index that was already received appends its bytes a second
//! time without changing the received count. Callers that retry chunks end up
//! with a corrupt file; this mirrors the existing client contract and is kept
//! on purpose.
//!
//! Every byte written, duplicates included, counts against the store's size
//! ceiling. A chunk that would cross it is refused before anything is written.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::files::{allowed_file, sanitize_filename};

#[derive(Debug)]
struct UploadSession {
    filename: String,
    declared_size: u64,
    chunk_count: usize,
    received: BTreeSet<usize>,
    written: u64,
    temp_path: PathBuf,
    // Set under the session lock once the session leaves the map.
    closed: bool,
    created_at: Instant,
    last_activity: Instant,
}

/// Progress reported after each chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkProgress {
    pub received: usize,
    pub total: usize,
    pub is_complete: bool,
}

/// Session store shared by all request handlers.
///
/// The map lock is held only for lookups and removals; appends to one
/// session are serialized by that session's own async lock.
#[derive(Debug, Clone)]
pub struct UploadStore {
    sessions: Arc<RwLock<HashMap<String, Arc<Mutex<UploadSession>>>>>,
    dir: PathBuf,
    max_file_size: u64,
}

impl UploadStore {
    pub fn new(dir: impl Into<PathBuf>, max_file_size: u64) -> Self {
        Self {
            sessions: Arc::default(),
            dir: dir.into(),
            max_file_size,
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    pub fn contains(&self, upload_id: &str) -> bool {
        self.read_map().contains_key(upload_id)
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Mutex<UploadSession>>>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_map(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Mutex<UploadSession>>>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(&self, upload_id: &str) -> Result<Arc<Mutex<UploadSession>>> {
        self.read_map()
            .get(upload_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound("Invalid upload session".to_string()))
    }

    /// Open a session and create its empty backing file.
    pub async fn init(&self, filename: &str, declared_size: u64, chunk_count: usize) -> Result<String> {
        let filename = sanitize_filename(filename);
        if filename.is_empty() || !allowed_file(&filename) {
            return Err(GatewayError::InvalidInput(
                "Invalid filename or file type".to_string(),
            ));
        }
        if declared_size > self.max_file_size {
            return Err(GatewayError::InvalidInput(format!(
                "File too large. Maximum size is {:.1}MB",
                self.max_file_size as f64 / (1024.0 * 1024.0)
            )));
        }
        if chunk_count == 0 {
            return Err(GatewayError::InvalidInput(
                "chunk_count must be at least 1".to_string(),
            ));
        }

        let upload_id = Uuid::new_v4().to_string();
        let temp_path = self.dir.join(format!("upload_{}", upload_id));
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::File::create(&temp_path).await?;

        let now = Instant::now();
        let session = UploadSession {
            filename: filename.clone(),
            declared_size,
            chunk_count,
            received: BTreeSet::new(),
            written: 0,
            temp_path,
            closed: false,
            created_at: now,
            last_activity: now,
        };
        self.write_map()
            .insert(upload_id.clone(), Arc::new(Mutex::new(session)));

        info!(
            "Upload {} started: {} ({} bytes in {} chunks)",
            upload_id, filename, declared_size, chunk_count
        );
        Ok(upload_id)
    }

    /// Append one chunk to the session's file and record its index.
    pub async fn append_chunk(&self, upload_id: &str, chunk_index: i64, bytes: &[u8]) -> Result<ChunkProgress> {
        let session = self.lookup(upload_id)?;
        self.append_to(&session, upload_id, chunk_index, bytes).await
    }

    // A handle fetched before a concurrent complete/cancel may be stale by
    // the time its lock is acquired.
    async fn append_to(
        &self,
        session: &Mutex<UploadSession>,
        upload_id: &str,
        chunk_index: i64,
        bytes: &[u8],
    ) -> Result<ChunkProgress> {
        let mut session = session.lock().await;
        if session.closed {
            return Err(GatewayError::NotFound("Invalid upload session".to_string()));
        }

        let index = usize::try_from(chunk_index)
            .map_err(|_| GatewayError::InvalidInput("Invalid chunk index".to_string()))?;
        if index >= session.chunk_count {
            return Err(GatewayError::InvalidInput(format!(
                "Invalid chunk index: {} (expected 0..{})",
                index, session.chunk_count
            )));
        }
        let len = bytes.len() as u64;
        if session.written.saturating_add(len) > self.max_file_size {
            return Err(GatewayError::InvalidInput(format!(
                "Upload exceeds maximum size of {:.1}MB",
                self.max_file_size as f64 / (1024.0 * 1024.0)
            )));
        }

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&session.temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        session.written += len;

        if !session.received.insert(index) {
            warn!(
                "Upload {}: chunk {} received again, bytes appended twice",
                upload_id, index
            );
        }
        session.last_activity = Instant::now();

        let progress = ChunkProgress {
            received: session.received.len(),
            total: session.chunk_count,
            is_complete: session.received.len() == session.chunk_count,
        };
        debug!(
            "Upload {}: chunk {} ({} bytes), {}/{}",
            upload_id,
            index,
            bytes.len(),
            progress.received,
            progress.total
        );
        Ok(progress)
    }

    /// Finish the upload and hand the reassembled file to `process`.
    ///
    /// The session is removed and the file deleted whether or not `process`
    /// succeeds. An incomplete session is left untouched.
    pub async fn complete<F, Fut, T>(&self, upload_id: &str, process: F) -> Result<T>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = self.lookup(upload_id)?;
        let mut guard = handle.lock().await;
        if guard.closed {
            return Err(GatewayError::NotFound("Invalid upload session".to_string()));
        }

        if guard.received.len() != guard.chunk_count {
            return Err(GatewayError::IncompleteUpload {
                received: guard.received.len(),
                total: guard.chunk_count,
            });
        }

        let removed = self.write_map().remove(upload_id).is_some();
        if !removed {
            // Completed or cancelled by a concurrent request while we waited.
            return Err(GatewayError::NotFound("Invalid upload session".to_string()));
        }
        guard.closed = true;

        let final_path = self.dir.join(format!("{}-{}", upload_id, guard.filename));
        let temp_path = guard.temp_path.clone();
        info!(
            "Upload {} complete: {} ({} declared bytes, open {:?})",
            upload_id,
            guard.filename,
            guard.declared_size,
            guard.created_at.elapsed()
        );
        drop(guard);

        if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
            remove_quietly(&temp_path).await;
            return Err(e.into());
        }

        let outcome = process(final_path.clone()).await;
        remove_quietly(&final_path).await;
        outcome
    }

    /// Drop a session and its backing file.
    pub async fn cancel(&self, upload_id: &str) -> Result<()> {
        let handle = self
            .write_map()
            .remove(upload_id)
            .ok_or_else(|| GatewayError::NotFound("Invalid upload session".to_string()))?;

        let temp_path = {
            let mut session = handle.lock().await;
            session.closed = true;
            session.temp_path.clone()
        };
        remove_quietly(&temp_path).await;
        info!("Upload {} cancelled", upload_id);
        Ok(())
    }

    /// Remove sessions idle for longer than `ttl`; returns how many were dropped.
    pub async fn sweep_expired(&self, ttl: Duration) -> usize {
        let candidates: Vec<(String, Arc<Mutex<UploadSession>>)> = self
            .read_map()
            .iter()
            .map(|(id, s)| (id.clone(), Arc::clone(s)))
            .collect();

        let mut swept = 0;
        for (upload_id, handle) in candidates {
            // Sessions busy with a chunk or completion are active by definition.
            let Ok(mut session) = handle.try_lock() else {
                continue;
            };
            if session.last_activity.elapsed() < ttl {
                continue;
            }
            let removed = self.write_map().remove(&upload_id).is_some();
            if removed {
                session.closed = true;
                remove_quietly(&session.temp_path).await;
                swept += 1;
                info!(
                    "Upload {} expired after {:?} idle ({}/{} chunks)",
                    upload_id,
                    session.last_activity.elapsed(),
                    session.received.len(),
                    session.chunk_count
                );
            }
        }
        swept
    }
}

/// Periodically sweep idle sessions until the process exits.
pub fn spawn_sweeper(store: UploadStore, ttl: Duration, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let swept = store.sweep_expired(ttl).await;
            if swept > 0 {
                debug!("Swept {} idle upload sessions, {} still open", swept, store.len());
            }
        }
    })
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {:?}: {}", path, e);
        }
    }
}
