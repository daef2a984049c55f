use std::path::PathBuf;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Minimum gap between a document turning dirty and its write hitting disk.
const DEBOUNCE: Duration = Duration::from_secs(1);

/// Directory of JSON documents, one per logical store. Documents are
/// entry arrays (`[[key, value], …]`) so non-string map keys survive a
/// round-trip.
#[derive(Debug, Clone)]
pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("Could not create data dir {}: {e}", dir.display());
        }
        Self { dir }
    }

    fn path_of(&self, doc: &str) -> PathBuf {
        self.dir.join(format!("{doc}.json"))
    }

    /// Best-effort load: a missing or malformed document yields an empty
    /// entry list.
    pub async fn load_entries<K, V>(&self, doc: &str) -> Vec<(K, V)>
    where
        K: DeserializeOwned,
        V: DeserializeOwned,
    {
        let path = self.path_of(doc);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_str(&text) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Persisted document {doc} unreadable ({e}) — starting empty");
                Vec::new()
            }
        }
    }

    /// Spawn a debounced writer task for one document and return its handle.
    pub fn writer(&self, doc: &str) -> DocWriter {
        let (tx, rx) = mpsc::unbounded_channel();
        let path = self.path_of(doc);
        let name = doc.to_string();
        tokio::spawn(run_writer(name, path, rx));
        DocWriter { tx }
    }
}

/// Serialize a map's entries as a sorted `[[key, value], …]` array.
pub fn to_entry_array<K, V, I>(entries: I) -> Value
where
    K: Serialize + Ord,
    V: Serialize,
    I: IntoIterator<Item = (K, V)>,
{
    let mut entries: Vec<(K, V)> = entries.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    serde_json::to_value(entries).unwrap_or(Value::Array(Vec::new()))
}

enum WriterMsg {
    Save(Value),
    Flush(oneshot::Sender<()>),
}

/// Handle to one document's debounced writer.
#[derive(Clone)]
pub struct DocWriter {
    tx: mpsc::UnboundedSender<WriterMsg>,
}

impl DocWriter {
    /// Queue the latest full document value. Consecutive queues within the
    /// debounce window collapse into one write.
    pub fn queue(&self, value: Value) {
        let _ = self.tx.send(WriterMsg::Save(value));
    }

    /// Write any pending value now. Used at shutdown.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriterMsg::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

async fn run_writer(name: String, path: PathBuf, mut rx: mpsc::UnboundedReceiver<WriterMsg>) {
    let mut pending: Option<Value> = None;
    let mut deadline = Instant::now();

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(WriterMsg::Save(value)) => {
                    if pending.is_none() {
                        deadline = Instant::now() + DEBOUNCE;
                    }
                    pending = Some(value);
                }
                Some(WriterMsg::Flush(ack)) => {
                    if let Some(value) = pending.take() {
                        if let Err(e) = write_doc(&path, &value).await {
                            warn!("Flush of {name} failed: {e}");
                        }
                    }
                    let _ = ack.send(());
                }
                None => {
                    // Handle dropped: final write, then exit.
                    if let Some(value) = pending.take() {
                        if let Err(e) = write_doc(&path, &value).await {
                            warn!("Final write of {name} failed: {e}");
                        }
                    }
                    return;
                }
            },
            _ = tokio::time::sleep_until(deadline), if pending.is_some() => {
                if let Some(value) = pending.take() {
                    match write_doc(&path, &value).await {
                        Ok(()) => debug!("Persisted {name}"),
                        Err(e) => {
                            // Keep the value; the next debounce retries it.
                            warn!(
                                "{name}: {} — retrying",
                                crate::error::EngineError::Persistence(e)
                            );
                            pending = Some(value);
                            deadline = Instant::now() + DEBOUNCE;
                        }
                    }
                }
            }
        }
    }
}

async fn write_doc(path: &PathBuf, value: &Value) -> std::io::Result<()> {
    let body = serde_json::to_vec(value)?;
    tokio::fs::write(path, body).await
}
