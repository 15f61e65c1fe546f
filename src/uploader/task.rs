// 上传任务定义
//
// 一次上传的输入（文件与选项）和输出（远端地址与完成信息）

use crate::uploader::cancel::CancellationController;
use crate::uploader::chunk::normalize_chunk_size_hint;
use crate::uploader::error::UploadError;
use crate::uploader::progress::{NoopObserver, ProgressObserver, UploadStage};
use crate::uploader::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// 默认取消通知超时: 5 秒
pub const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

/// 待上传文件
#[derive(Debug, Clone)]
pub struct UploadSource {
    /// 本地文件路径
    pub path: PathBuf,
    /// 上报给服务器的文件名
    pub filename: String,
    pub mime_type: String,
    /// 附加元数据，原样发送
    pub metadata: Option<Value>,
}

impl UploadSource {
    /// 由本地路径创建，文件名取路径最后一段，MIME 类型按扩展名推断
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_string());
        let mime_type = mime_guess::from_path(&path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Self {
            path,
            filename,
            mime_type,
            metadata: None,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// 上传选项
#[derive(Clone)]
pub struct UploadOptions {
    /// 建议分片大小，服务器可覆盖
    pub chunk_size: Option<u64>,
    pub retry: RetryPolicy,
    pub observer: Arc<dyn ProgressObserver>,
    pub cancellation: CancellationController,
    /// 续传已有会话；为空时总是发起新会话
    pub resume_session_id: Option<String>,
    /// 本地大小预检上限，为空时不检查
    pub max_file_size: Option<u64>,
    /// 取消后通知服务器的超时
    pub cancel_timeout: Duration,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: None,
            retry: RetryPolicy::default(),
            observer: Arc::new(NoopObserver),
            cancellation: CancellationController::new(),
            resume_session_id: None,
            max_file_size: None,
            cancel_timeout: DEFAULT_CANCEL_TIMEOUT,
        }
    }
}

impl fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadOptions")
            .field("chunk_size", &self.chunk_size)
            .field("retry", &self.retry)
            .field("cancelled", &self.cancellation.is_cancelled())
            .field("resume_session_id", &self.resume_session_id)
            .field("max_file_size", &self.max_file_size)
            .field("cancel_timeout", &self.cancel_timeout)
            .finish()
    }
}

impl UploadOptions {
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationController) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn resume(mut self, session_id: impl Into<String>) -> Self {
        self.resume_session_id = Some(session_id.into());
        self
    }

    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = Some(max_file_size);
        self
    }

    /// 发送给服务器的分片大小建议
    pub fn chunk_size_hint(&self) -> Option<u64> {
        normalize_chunk_size_hint(self.chunk_size)
    }

    pub fn validate(&self) -> Result<(), UploadError> {
        self.retry.validate()?;
        if let Some(id) = &self.resume_session_id {
            if id.trim().is_empty() {
                return Err(UploadError::validation("续传会话 ID 不能为空"));
            }
        }
        Ok(())
    }
}

/// 上传结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub session_id: String,
    /// 远端文件地址
    pub remote_url: String,
    pub size: u64,
    pub completed_at: DateTime<Utc>,
}

/// 编排器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Preparing,
    OpeningSession,
    Transmitting,
    /// 可从 OpeningSession、Transmitting 或 Finalizing 重入
    Retrying,
    Finalizing,
    Completed,
    Cancelled,
    Failed,
}

impl OrchestratorState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestratorState::Completed | OrchestratorState::Cancelled | OrchestratorState::Failed
        )
    }

    /// 对外上报的阶段
    pub fn stage(&self) -> UploadStage {
        match self {
            OrchestratorState::Preparing | OrchestratorState::OpeningSession => {
                UploadStage::Preparing
            }
            OrchestratorState::Transmitting => UploadStage::Uploading,
            OrchestratorState::Retrying => UploadStage::Retrying,
            OrchestratorState::Finalizing => UploadStage::Validating,
            OrchestratorState::Completed => UploadStage::Completed,
            OrchestratorState::Cancelled => UploadStage::Cancelled,
            OrchestratorState::Failed => UploadStage::Failed,
        }
    }

    /// 状态转移是否合法
    ///
    /// 终止状态不能再离开；Cancelled/Failed 可由任意非终止状态进入
    pub fn can_transition_to(&self, next: OrchestratorState) -> bool {
        use OrchestratorState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Cancelled) | (_, Failed) => true,
            (Preparing, OpeningSession) => true,
            (OpeningSession, Transmitting) | (OpeningSession, Retrying) => true,
            (Transmitting, Retrying) | (Transmitting, Finalizing) => true,
            (Retrying, OpeningSession) | (Retrying, Transmitting) | (Retrying, Finalizing) => true,
            (Finalizing, Completed) | (Finalizing, Retrying) => true,
            _ => false,
        }
    }
}
