use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use formic_core::Stage;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

const HISTORY_BYTES_LIMIT: usize = 4 * 1024 * 1024;
const CHANNEL_CAPACITY: usize = 1000;
const SYSTEM_PREFIX: &str = "[formic]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Lines written by the runner itself
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub seq: u64,
    pub stream: LogStream,
    pub line: String,
    pub timestamp: DateTime<Utc>,
}

impl LogLine {
    fn approx_bytes(&self) -> usize {
        const OVERHEAD: usize = 48;
        OVERHEAD + self.line.len()
    }
}

struct StoredLine {
    line: LogLine,
    bytes: usize,
}

struct LogInner {
    history: VecDeque<StoredLine>,
    total_bytes: usize,
    dropped: usize,
    next_seq: u64,
    // None once closed
    sender: Option<broadcast::Sender<LogLine>>,
}

/// Output captured for one stage run of one task.
///
/// Appends are ordered by arrival; once closed, further appends are ignored.
pub struct StageLog {
    task_id: Uuid,
    stage: Stage,
    inner: RwLock<LogInner>,
}

impl StageLog {
    pub fn new(task_id: Uuid, stage: Stage) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            task_id,
            stage,
            inner: RwLock::new(LogInner {
                history: VecDeque::with_capacity(64),
                total_bytes: 0,
                dropped: 0,
                next_seq: 0,
                sender: Some(sender),
            }),
        }
    }

    /// Closed log holding previously recorded text, one line per entry.
    ///
    /// The original stream of each line is not kept; runner lines are
    /// recognised by their prefix and everything else reads as stdout.
    pub fn from_text(task_id: Uuid, stage: Stage, text: &str) -> Self {
        let log = Self::new(task_id, stage);
        for line in text.lines() {
            let stream = if line.starts_with(SYSTEM_PREFIX) {
                LogStream::System
            } else {
                LogStream::Stdout
            };
            log.push(stream, line);
        }
        log.close();
        log
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Append a line; returns false if the log is already closed.
    pub fn push(&self, stream: LogStream, line: impl Into<String>) -> bool {
        let mut inner = self.write();
        let Some(sender) = inner.sender.clone() else {
            return false;
        };

        let line = LogLine {
            seq: inner.next_seq,
            stream,
            line: line.into(),
            timestamp: Utc::now(),
        };
        inner.next_seq += 1;
        let _ = sender.send(line.clone());

        let bytes = line.approx_bytes();
        while inner.total_bytes.saturating_add(bytes) > HISTORY_BYTES_LIMIT {
            if let Some(front) = inner.history.pop_front() {
                inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes);
                inner.dropped += 1;
            } else {
                break;
            }
        }

        inner.history.push_back(StoredLine { line, bytes });
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
        true
    }

    pub fn push_system(&self, message: impl AsRef<str>) -> bool {
        self.push(
            LogStream::System,
            format!("{} {}", SYSTEM_PREFIX, message.as_ref()),
        )
    }

    /// Stop accepting lines and end every live subscription.
    pub fn close(&self) {
        self.write().sender = None;
    }

    pub fn is_closed(&self) -> bool {
        self.read().sender.is_none()
    }

    pub fn history(&self) -> Vec<LogLine> {
        self.read().history.iter().map(|s| s.line.clone()).collect()
    }

    pub fn history_len(&self) -> usize {
        self.read().history.len()
    }

    pub fn history_bytes(&self) -> usize {
        self.read().total_bytes
    }

    /// Whether the process produced any stdout or stderr output.
    pub fn has_process_output(&self) -> bool {
        self.read()
            .history
            .iter()
            .any(|s| s.line.stream != LogStream::System && !s.line.line.trim().is_empty())
    }

    /// Captured text as stored in the task's log mapping.
    pub fn contents(&self) -> String {
        let inner = self.read();
        let mut out = String::with_capacity(inner.total_bytes);
        if inner.dropped > 0 {
            out.push_str(&format!(
                "{} {} earlier lines truncated\n",
                SYSTEM_PREFIX, inner.dropped
            ));
        }
        for (i, stored) in inner.history.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(&stored.line.line);
        }
        out
    }

    /// Only lines pushed after this call are received.
    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        Self::receiver(&self.read())
    }

    /// History followed by live lines; ends when the log closes.
    pub fn history_plus_stream(&self) -> impl Stream<Item = LogLine> + Send + 'static {
        let (history, rx) = {
            let inner = self.read();
            let history: Vec<LogLine> = inner.history.iter().map(|s| s.line.clone()).collect();
            (history, Self::receiver(&inner))
        };

        let hist_stream = futures::stream::iter(history);
        let live_stream = BroadcastStream::new(rx)
            .filter_map(|res: Result<LogLine, _>| async move { res.ok() });

        hist_stream.chain(live_stream)
    }

    pub fn subscriber_count(&self) -> usize {
        self.read()
            .sender
            .as_ref()
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    fn receiver(inner: &LogInner) -> broadcast::Receiver<LogLine> {
        match &inner.sender {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, rx) = broadcast::channel(1);
                drop(sender);
                rx
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, LogInner> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, LogInner> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl std::fmt::Debug for StageLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageLog")
            .field("task_id", &self.task_id)
            .field("stage", &self.stage)
            .field("lines", &self.history_len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Registry of stage logs keyed by task and stage.
#[derive(Clone, Default)]
pub struct LogStreamer {
    logs: Arc<RwLock<HashMap<(Uuid, Stage), Arc<StageLog>>>>,
}

impl LogStreamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh log for a stage run, closing any previous one.
    pub fn open(&self, task_id: Uuid, stage: Stage) -> Arc<StageLog> {
        let log = Arc::new(StageLog::new(task_id, stage));
        let previous = self
            .logs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert((task_id, stage), Arc::clone(&log));
        if let Some(previous) = previous {
            previous.close();
        }
        log
    }

    pub fn get(&self, task_id: Uuid, stage: Stage) -> Option<Arc<StageLog>> {
        self.logs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(task_id, stage))
            .cloned()
    }

    /// Drop `log` from the registry once it is closed and its text has been
    /// recorded elsewhere. A newer log for the same stage is left in place.
    pub fn evict(&self, log: &Arc<StageLog>) -> bool {
        if !log.is_closed() {
            return false;
        }
        let mut logs = self.logs.write().unwrap_or_else(|p| p.into_inner());
        let key = (log.task_id(), log.stage());
        match logs.get(&key) {
            Some(current) if Arc::ptr_eq(current, log) => {
                logs.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn remove_task(&self, task_id: Uuid) {
        let mut logs = self.logs.write().unwrap_or_else(|p| p.into_inner());
        logs.retain(|(id, _), log| {
            if *id == task_id {
                log.close();
                false
            } else {
                true
            }
        });
    }

    pub fn len(&self) -> usize {
        self.logs.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for LogStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStreamer").field("logs", &self.len()).finish()
    }
}
