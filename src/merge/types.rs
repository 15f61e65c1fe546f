// 三段合并上传的数据类型

use crate::api::types::MergeStatusResponse;
use crate::uploader::error::{UploadError, UploadErrorKind};
use crate::uploader::progress::UploadStage;
use crate::uploader::task::{UploadOptions, UploadResult};
use crate::uploader::CancellationController;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// 一次合并固定为三段陈述视频
pub const STATEMENT_COUNT: usize = 3;

/// 默认轮询间隔: 2 秒
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;

/// 默认轮询退避倍数
pub const DEFAULT_POLL_BACKOFF_MULTIPLIER: f64 = 1.5;

/// 默认最大轮询间隔: 10 秒
pub const DEFAULT_MAX_POLL_INTERVAL_MS: u64 = 10_000;

/// 默认最大轮询次数
pub const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 60;

/// 一段待上传的陈述视频
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementClip {
    pub statement_index: u8,
    pub path: PathBuf,
    pub duration_ms: u64,
}

impl StatementClip {
    pub fn new(statement_index: u8, path: impl Into<PathBuf>, duration_ms: u64) -> Self {
        Self {
            statement_index,
            path: path.into(),
            duration_ms,
        }
    }
}

/// 服务器端合并状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStatus {
    Pending,
    #[serde(alias = "processing")]
    Merging,
    Completed,
    Failed,
}

impl MergeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MergeStatus::Completed | MergeStatus::Failed)
    }
}

/// 单段视频在合并结果中的时间范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMetadata {
    pub statement_index: u8,
    pub start_time_ms: u64,
    pub end_time_ms: u64,
}

impl SegmentMetadata {
    pub fn new(statement_index: u8, start_time_ms: u64, end_time_ms: u64) -> Self {
        Self {
            statement_index,
            start_time_ms,
            end_time_ms,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_time_ms.saturating_sub(self.start_time_ms)
    }
}

/// 合并提交方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    /// 三段分别走分片上传，再以三个会话 ID 发起合并
    #[default]
    Sessions,
    /// 三段作为一个 multipart 请求提交，服务器收齐后自动合并
    Combined,
}

/// 合并状态轮询策略
///
/// 第 n 次轮询前等待 interval * multiplier^(n-1)，上限 max_interval
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_POLL_INTERVAL_MS,
            multiplier: DEFAULT_POLL_BACKOFF_MULTIPLIER,
            max_interval_ms: DEFAULT_MAX_POLL_INTERVAL_MS,
            max_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
        }
    }
}

impl PollPolicy {
    /// 固定间隔轮询
    pub fn fixed(interval_ms: u64, max_attempts: u32) -> Self {
        Self {
            interval_ms,
            multiplier: 1.0,
            max_interval_ms: interval_ms,
            max_attempts,
        }
    }

    /// 第 n 次轮询前的等待时间（从 1 开始）
    pub fn delay(&self, poll_number: u32) -> Duration {
        let exponent = poll_number.saturating_sub(1) as i32;
        let raw = self.interval_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = if raw.is_finite() {
            (raw as u64).min(self.max_interval_ms.max(self.interval_ms))
        } else {
            self.max_interval_ms.max(self.interval_ms)
        };
        Duration::from_millis(capped)
    }
}

/// 三段合并上传的进行中状态
///
/// 只有三个会话都完成后才会创建
#[derive(Debug, Clone)]
pub struct MergeUpload {
    /// 按 statement_index 升序；combined 模式下为空
    pub clips: Vec<UploadResult>,
    pub merge_session_id: String,
    pub status: MergeStatus,
    pub merged_video_url: Option<String>,
    pub segment_metadata: Vec<SegmentMetadata>,
}

impl MergeUpload {
    pub fn new(merge_session_id: String, clips: Vec<UploadResult>) -> Self {
        Self {
            clips,
            merge_session_id,
            status: MergeStatus::Pending,
            merged_video_url: None,
            segment_metadata: Vec::new(),
        }
    }

    /// 应用一次状态查询结果；已终止时忽略
    pub fn apply_status(&mut self, resp: &MergeStatusResponse) {
        if self.status.is_terminal() {
            return;
        }
        self.status = resp.status;
        if let Some(url) = &resp.merged_video_url {
            self.merged_video_url = Some(url.clone());
        }
        if let Some(segments) = &resp.segment_metadata {
            self.segment_metadata = segments.clone();
        }
    }
}

/// 合并完成的视频
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedAsset {
    pub merge_session_id: String,
    pub merged_video_url: String,
    pub segments: Vec<SegmentMetadata>,
    /// 各段的上传结果，combined 模式下为空
    pub clips: Vec<UploadResult>,
}

/// 合并流程阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStage {
    Uploading,
    Merging,
    Completed,
    Cancelled,
    Failed,
}

/// 单段上传进度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipProgress {
    pub statement_index: u8,
    pub stage: UploadStage,
    pub progress_percent: f64,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
}

/// 合并流程的整体进度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeProgress {
    pub stage: MergeStage,
    /// 三段按字节加权的上传进度
    pub progress_percent: f64,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub clips: Vec<ClipProgress>,
    pub merge_status: Option<MergeStatus>,
}

/// 合并进度观察者
pub trait MergeObserver: Send + Sync {
    fn on_progress(&self, _progress: &MergeProgress) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMergeObserver;

impl MergeObserver for NoopMergeObserver {}

/// 合并选项
#[derive(Clone)]
pub struct MergeOptions {
    /// 每段上传使用的选项模板（观察者、取消令牌、续传会话会被替换）
    pub upload: UploadOptions,
    pub mode: MergeMode,
    pub poll: PollPolicy,
    pub observer: Arc<dyn MergeObserver>,
    pub cancellation: CancellationController,
    /// 随合并请求发送的附加元数据
    pub metadata: Option<Value>,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            upload: UploadOptions::default(),
            mode: MergeMode::default(),
            poll: PollPolicy::default(),
            observer: Arc::new(NoopMergeObserver),
            cancellation: CancellationController::new(),
            metadata: None,
        }
    }
}

impl fmt::Debug for MergeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeOptions")
            .field("upload", &self.upload)
            .field("mode", &self.mode)
            .field("poll", &self.poll)
            .field("cancelled", &self.cancellation.is_cancelled())
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl MergeOptions {
    pub fn with_upload(mut self, upload: UploadOptions) -> Self {
        self.upload = upload;
        self
    }

    pub fn with_mode(mut self, mode: MergeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn MergeObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationController) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// 合并上传错误
#[derive(Debug, Clone, thiserror::Error)]
pub enum MergeError {
    /// 某一段上传最终失败，合并不会发起
    #[error("陈述 #{statement_index} 上传失败: {error}")]
    ClipFailed {
        statement_index: u8,
        error: UploadError,
    },

    /// 参数校验、合并请求、轮询或分段校验失败，以及取消
    #[error("{0}")]
    Merge(#[from] UploadError),
}

impl MergeError {
    pub fn kind(&self) -> UploadErrorKind {
        self.upload_error().kind
    }

    pub fn upload_error(&self) -> &UploadError {
        match self {
            MergeError::ClipFailed { error, .. } => error,
            MergeError::Merge(error) => error,
        }
    }

    /// 失败的陈述序号
    pub fn statement_index(&self) -> Option<u8> {
        match self {
            MergeError::ClipFailed {
                statement_index, ..
            } => Some(*statement_index),
            MergeError::Merge(_) => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.upload_error().is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_status_decode() {
        let status: MergeStatus = serde_json::from_str("\"processing\"").unwrap();
        assert_eq!(status, MergeStatus::Merging);
        let status: MergeStatus = serde_json::from_str("\"completed\"").unwrap();
        assert!(status.is_terminal());
    }

    #[test]
    fn test_segment_decode() {
        let json = r#"{"statementIndex": 1, "startTimeMs": 5000, "endTimeMs": 11000}"#;
        let segment: SegmentMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(segment, SegmentMetadata::new(1, 5000, 11000));
        assert_eq!(segment.duration_ms(), 6000);
    }

    #[test]
    fn test_poll_policy_delay() {
        let policy = PollPolicy {
            interval_ms: 1000,
            multiplier: 2.0,
            max_interval_ms: 5000,
            max_attempts: 10,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(1000));
        assert_eq!(policy.delay(2), Duration::from_millis(2000));
        assert_eq!(policy.delay(3), Duration::from_millis(4000));
        assert_eq!(policy.delay(4), Duration::from_millis(5000));
        assert_eq!(policy.delay(40), Duration::from_millis(5000));

        let fixed = PollPolicy::fixed(500, 3);
        assert_eq!(fixed.delay(7), Duration::from_millis(500));
    }

    #[test]
    fn test_merge_upload_ignores_updates_after_terminal() {
        let mut upload = MergeUpload::new("m-1".to_string(), Vec::new());
        let failed: MergeStatusResponse =
            serde_json::from_str(r#"{"status": "failed", "error": "ffmpeg"}"#).unwrap();
        upload.apply_status(&failed);
        let completed: MergeStatusResponse = serde_json::from_str(
            r#"{"status": "completed", "mergedVideoUrl": "https://cdn.example.com/m.mp4"}"#,
        )
        .unwrap();
        upload.apply_status(&completed);
        assert_eq!(upload.status, MergeStatus::Failed);
        assert!(upload.merged_video_url.is_none());
    }

    #[test]
    fn test_merge_error_accessors() {
        let err = MergeError::ClipFailed {
            statement_index: 2,
            error: UploadError::new(UploadErrorKind::ServerError, "boom"),
        };
        assert_eq!(err.statement_index(), Some(2));
        assert_eq!(err.kind(), UploadErrorKind::ServerError);

        let err: MergeError = UploadError::cancelled().into();
        assert!(err.is_cancelled());
        assert_eq!(err.statement_index(), None);
    }
}
