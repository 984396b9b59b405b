use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use url::Url;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use super::{Session, SessionRecord};

#[derive(Debug, Error)]
pub enum Error {
    #[error("session storage IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("session encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// In-memory session map. One mutex guards the map and all mutation of
/// session fields; it is never held across I/O. A depth-1 nudge channel
/// coalesces save requests.
pub struct Store {
    sessions: Mutex<HashMap<String, Session>>,
    save_tx: mpsc::Sender<()>,
}

impl Store {
    /// Returns the store and the receiving end of the save signal for the
    /// save worker.
    pub fn new() -> (Self, mpsc::Receiver<()>) {
        let (save_tx, save_rx) = mpsc::channel(1);
        (
            Store {
                sessions: Mutex::new(HashMap::new()),
                save_tx,
            },
            save_rx,
        )
    }

    /// Inserts a fully-wired session and nudges the save worker. A full
    /// channel means a save is already pending; the extra signal is dropped.
    pub fn insert(&self, session: Session) {
        let id = session.record.id.clone();
        self.sessions
            .lock()
            .expect("session lock poisoned")
            .insert(id, session);
        let _ = self.save_tx.try_send(());
    }

    /// Removes and returns the session so the caller can tear it down.
    pub fn remove(&self, id: &str) -> Option<Session> {
        self.sessions.lock().expect("session lock poisoned").remove(id)
    }

    /// The upstream URL of a session, if it exists.
    pub fn upstream_url(&self, id: &str) -> Option<Url> {
        self.sessions
            .lock()
            .expect("session lock poisoned")
            .get(id)
            .map(|session| session.record.upstream_url().clone())
    }

    /// Refreshes update/expire times after a successful next-hop update.
    /// Returns false when the session vanished in the meantime.
    pub fn touch(&self, id: &str, ttl: Duration) -> bool {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        match sessions.get_mut(id) {
            Some(session) => {
                let now = SystemTime::now();
                session.record.update_time = now;
                session.record.expire_time = now + ttl;
                true
            }
            None => false,
        }
    }

    /// Removes every session whose expire time has passed and hands them
    /// back for teardown.
    pub fn take_expired(&self, now: SystemTime) -> Vec<Session> {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, session)| session.record.expired(now))
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| sessions.remove(&id))
            .collect()
    }

    /// Snapshot of the non-expired records, for saving.
    pub fn records(&self) -> Vec<SessionRecord> {
        let now = SystemTime::now();
        self.sessions
            .lock()
            .expect("session lock poisoned")
            .values()
            .filter(|session| !session.record.expired(now))
            .map(|session| session.record.clone())
            .collect()
    }

    /// Snapshot of all sessions with their datapath counters, for the
    /// admin surface.
    pub fn records_with_stats(&self) -> Vec<(SessionRecord, SessionStats)> {
        self.sessions
            .lock()
            .expect("session lock poisoned")
            .values()
            .map(|session| {
                let (tx_packets, tx_bytes) = session.downstream.stats();
                let (rx_packets, rx_bytes) = session.upstream.stats();
                (
                    session.record.clone(),
                    SessionStats {
                        tx_packets,
                        tx_bytes,
                        rx_packets,
                        rx_bytes,
                    },
                )
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("session lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct SessionStats {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
}

/// Writes one file per record (`<id>.json`, via `<id>.tmp.json` with fsync
/// and rename), then sweeps the directory so exactly the saved set remains.
pub async fn save_records(dir: &Path, records: &[SessionRecord]) -> Result<(), Error> {
    fs::create_dir_all(dir).await?;

    let mut saved: HashSet<String> = HashSet::new();
    for record in records {
        let tmp_path = dir.join(format!("{}.tmp.json", record.id));
        let path = dir.join(format!("{}.json", record.id));

        let data = serde_json::to_vec_pretty(record)?;
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, &path).await?;
        saved.insert(record.id.clone());
    }

    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".tmp.json") {
            fs::remove_file(entry.path()).await?;
            continue;
        }

        let Some(id) = name.strip_suffix(".json") else {
            continue;
        };
        if !saved.contains(id) {
            fs::remove_file(entry.path()).await?;
        }
    }

    Ok(())
}

/// Reads every `<id>.json` in the session directory. A missing directory is
/// an empty result, not an error.
pub async fn load_records(dir: &Path) -> Result<Vec<SessionRecord>, Error> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.ends_with(".json") || name.ends_with(".tmp.json") {
            continue;
        }

        let data = fs::read(entry.path()).await?;
        let record: SessionRecord = serde_json::from_slice(&data)?;
        records.push(record);
    }

    Ok(records)
}
