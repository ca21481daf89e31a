//! 受锁保护的文件仓储
//!
//! 演示接口在持有锁期间读写的共享文件。

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// 单文件仓储
#[derive(Debug, Clone)]
pub struct FileRepository {
    path: PathBuf,
}

impl FileRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取文件内容，文件不存在时返回空字符串
    pub async fn read(&self) -> io::Result<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    /// 覆盖写入文件内容
    pub async fn update(&self, content: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, content).await?;
        debug!(path = %self.path.display(), bytes = content.len(), "File updated");
        Ok(())
    }
}
