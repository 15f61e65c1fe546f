// 上传分片
//
// 分片大小由服务器在发起会话时决定，客户端只能给出建议值。
// 分片严格按索引升序逐个发送，同一会话任意时刻最多一个分片在途。

use crate::api::client::UploadApi;
use crate::api::types::ChunkAck;
use crate::uploader::cancel::CancellationController;
use crate::uploader::error::{UploadError, UploadErrorKind};
use crate::uploader::hash::HashComputer;
use crate::uploader::session::TransferSession;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// 默认建议分片大小: 5MB
pub const DEFAULT_CHUNK_SIZE_HINT: u64 = 5 * 1024 * 1024;

/// 最小建议分片大小: 256KB
pub const MIN_CHUNK_SIZE_HINT: u64 = 256 * 1024;

/// 最大建议分片大小: 64MB
pub const MAX_CHUNK_SIZE_HINT: u64 = 64 * 1024 * 1024;

/// 规范化客户端建议的分片大小
///
/// 建议值会被限制在 256KB-64MB 范围内；0 视为不提供建议
pub fn normalize_chunk_size_hint(hint: Option<u64>) -> Option<u64> {
    match hint {
        Some(0) | None => None,
        Some(size) => Some(size.clamp(MIN_CHUNK_SIZE_HINT, MAX_CHUNK_SIZE_HINT)),
    }
}

/// 上传分片信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChunk {
    /// 分片索引
    pub index: u32,
    /// 字节范围
    pub range: Range<u64>,
}

impl UploadChunk {
    pub fn new(index: u32, range: Range<u64>) -> Self {
        Self { index, range }
    }

    /// 按会话的分片计划取出第 index 个分片
    pub fn from_session(session: &TransferSession, index: u32) -> Self {
        Self::new(index, session.chunk_range(index))
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 读取分片数据
    ///
    /// # 参数
    /// * `file_path` - 本地文件路径
    pub async fn read_data(&self, file_path: &Path) -> Result<Vec<u8>, UploadError> {
        let mut file = File::open(file_path)
            .await
            .map_err(|e| read_error(file_path, "打开上传文件失败", e))?;

        file.seek(std::io::SeekFrom::Start(self.range.start))
            .await
            .map_err(|e| read_error(file_path, "文件定位失败", e))?;

        let mut buffer = vec![0u8; self.size() as usize];
        file.read_exact(&mut buffer)
            .await
            .map_err(|e| read_error(file_path, "读取分片数据失败", e))?;

        debug!(
            "读取分片 #{}: bytes={}..{}, 大小={} bytes",
            self.index,
            self.range.start,
            self.range.end,
            buffer.len()
        );

        Ok(buffer)
    }
}

fn read_error(path: &Path, what: &str, e: std::io::Error) -> UploadError {
    // 本地文件在上传途中被删除或截断，重试没有意义
    UploadError::new(
        UploadErrorKind::ValidationError,
        format!("{}: {:?}: {}", what, path, e),
    )
}

/// 单个分片的一次发送
///
/// 读取字节、计算分片哈希、提交，并把响应解释为分片确认或分类后的错误
#[derive(Clone)]
pub struct ChunkTransmitter {
    api: UploadApi,
    file_path: PathBuf,
}

impl ChunkTransmitter {
    pub fn new(api: UploadApi, file_path: impl Into<PathBuf>) -> Self {
        Self {
            api,
            file_path: file_path.into(),
        }
    }

    /// 发送一个分片
    ///
    /// # 参数
    /// * `session` - 当前会话
    /// * `index` - 分片索引
    /// * `attempt` - 第几次尝试（从 1 开始，仅用于日志）
    /// * `cancel` - 取消令牌，在途请求被取消时返回 CANCELLED
    pub async fn transmit(
        &self,
        session: &TransferSession,
        index: u32,
        attempt: u32,
        cancel: &CancellationController,
    ) -> Result<ChunkAck, UploadError> {
        cancel.check()?;

        let chunk = UploadChunk::from_session(session, index);
        let data = cancel.run(chunk.read_data(&self.file_path)).await??;
        let chunk_hash = HashComputer::digest_bytes(&data);

        debug!(
            "发送分片: session={}, #{}/{}, 大小={} bytes, 第 {} 次尝试",
            session.session_id,
            index,
            session.total_chunks,
            chunk.size(),
            attempt
        );

        let ack = self
            .api
            .upload_chunk(
                &session.chunk_path(index),
                &session.session_id,
                index,
                &chunk_hash,
                data,
                cancel,
            )
            .await?;

        if ack.chunk_index != index {
            return Err(UploadError::protocol(format!(
                "分片确认索引不匹配: 发送 #{}, 确认 #{}",
                index, ack.chunk_index
            )));
        }

        Ok(ack)
    }
}
