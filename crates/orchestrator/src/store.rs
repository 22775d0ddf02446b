use async_trait::async_trait;
use formic_core::Board;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;

/// Persistence port for a workspace board.
#[async_trait]
pub trait BoardStore: Send + Sync {
    /// `None` when nothing has been saved yet.
    async fn load(&self) -> Result<Option<Board>>;

    async fn save(&self, board: &Board) -> Result<()>;
}

/// Board stored as pretty JSON, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonBoardStore {
    path: PathBuf,
}

impl JsonBoardStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl BoardStore for JsonBoardStore {
    async fn load(&self) -> Result<Option<Board>> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, board: &Board) -> Result<()> {
        let content = serde_json::to_vec_pretty(board)?;
        write_atomic(&self.path, &content).await?;
        debug!(path = %self.path.display(), tasks = board.tasks.len(), "Board saved");
        Ok(())
    }
}

/// Write to a temp file in the same directory, fsync, then rename over `path`.
pub(crate) async fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).await?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let result = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(content).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&tmp).await;
    }
    result
}

/// Store kept in memory, for tests and ephemeral workspaces.
#[derive(Debug, Default)]
pub struct MemoryBoardStore {
    board: Mutex<Option<Board>>,
    saves: AtomicUsize,
}

impl MemoryBoardStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_board(board: Board) -> Self {
        Self {
            board: Mutex::new(Some(board)),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> Option<Board> {
        self.board.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl BoardStore for MemoryBoardStore {
    async fn load(&self) -> Result<Option<Board>> {
        Ok(self.current())
    }

    async fn save(&self, board: &Board) -> Result<()> {
        *self.board.lock().unwrap_or_else(|p| p.into_inner()) = Some(board.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
