//! 上传进度上报
//!
//! 进度通过观察者接口输出，同一套核心既能以回调方式使用，
//! 也能通过 [`ChannelObserver`] 以事件流方式消费。

use crate::uploader::error::UploadError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// 默认速度统计窗口: 5 秒
pub const DEFAULT_SPEED_WINDOW: Duration = Duration::from_secs(5);

/// 上传阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStage {
    Preparing,
    Uploading,
    Retrying,
    Validating,
    Completed,
    Cancelled,
    Failed,
}

impl UploadStage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStage::Completed | UploadStage::Cancelled | UploadStage::Failed
        )
    }
}

/// 进度快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    /// 会话 ID（会话建立前为空）
    pub session_id: Option<String>,
    pub stage: UploadStage,
    /// 已确认分片 / 总分片 * 100
    pub progress_percent: f64,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    /// 滚动窗口内的上传速度
    pub upload_speed_bytes_per_sec: u64,
    /// 预计剩余时间，速度未知时为空
    pub estimated_remaining_ms: Option<u64>,
    /// 本次上传累计重试次数
    pub retry_count: u32,
    pub last_error: Option<UploadError>,
}

/// 进度观察者
///
/// 所有方法默认不做任何事，按需实现
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, _snapshot: &ProgressSnapshot) {}

    /// 分片确认后调用
    fn on_chunk_complete(&self, _index: u32, _total: u32) {}

    /// 每次决定重试时调用，attempt 从 1 开始
    fn on_retry(&self, _attempt: u32, _error: &UploadError) {}
}

/// 空观察者
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {}

/// 上传事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 进度更新
    Progress { snapshot: ProgressSnapshot },
    /// 分片完成
    ChunkComplete { index: u32, total: u32 },
    /// 重试
    Retry { attempt: u32, error: UploadError },
}

/// 以 mpsc 通道输出事件的观察者
///
/// 接收端被丢弃后事件静默丢弃，不影响上传本身
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<UploadEvent>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::UnboundedSender<UploadEvent>) -> Self {
        Self { tx }
    }

    /// 创建观察者和对应的接收端
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UploadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl ProgressObserver for ChannelObserver {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        let _ = self.tx.send(UploadEvent::Progress {
            snapshot: snapshot.clone(),
        });
    }

    fn on_chunk_complete(&self, index: u32, total: u32) {
        let _ = self.tx.send(UploadEvent::ChunkComplete { index, total });
    }

    fn on_retry(&self, attempt: u32, error: &UploadError) {
        let _ = self.tx.send(UploadEvent::Retry {
            attempt,
            error: error.clone(),
        });
    }
}

/// 滚动窗口速度统计
#[derive(Debug)]
pub struct SpeedTracker {
    window: Duration,
    /// (时间, 累计字节数)
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// 记录当前累计字节数
    pub fn record(&mut self, total_bytes: u64) {
        let now = Instant::now();
        self.samples.push_back((now, total_bytes));

        // 保留一个窗口外的样本作为基准
        while self.samples.len() > 2 {
            let second = self.samples[1].0;
            if now.duration_since(second) >= self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// 当前速度（字节/秒）
    pub fn speed(&self) -> u64 {
        let (first, last) = match (self.samples.front(), self.samples.back()) {
            (Some(f), Some(l)) => (f, l),
            _ => return 0,
        };
        let elapsed = last.0.duration_since(first.0).as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }
        (last.1.saturating_sub(first.1) as f64 / elapsed) as u64
    }

    /// 预计剩余时间（毫秒）
    pub fn eta_ms(&self, remaining_bytes: u64) -> Option<u64> {
        let speed = self.speed();
        if speed == 0 {
            return None;
        }
        Some(remaining_bytes.saturating_mul(1000) / speed)
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new(DEFAULT_SPEED_WINDOW)
    }
}

/// 单次上传的进度状态，负责生成快照并通知观察者
pub(crate) struct ProgressReporter {
    observer: Arc<dyn ProgressObserver>,
    session_id: Option<String>,
    total_bytes: u64,
    uploaded_bytes: u64,
    percent: f64,
    retry_count: u32,
    last_error: Option<UploadError>,
    speed: SpeedTracker,
    last_stage: Option<UploadStage>,
}

impl ProgressReporter {
    pub(crate) fn new(observer: Arc<dyn ProgressObserver>, total_bytes: u64) -> Self {
        Self {
            observer,
            session_id: None,
            total_bytes,
            uploaded_bytes: 0,
            percent: 0.0,
            retry_count: 0,
            last_error: None,
            speed: SpeedTracker::default(),
            last_stage: None,
        }
    }

    /// 进入新会话，进度归零后以会话已有进度为起点
    pub(crate) fn begin_session(&mut self, session_id: &str, uploaded_bytes: u64, percent: f64) {
        self.session_id = Some(session_id.to_string());
        self.uploaded_bytes = uploaded_bytes;
        self.percent = percent;
        self.speed.reset();
        self.speed.record(uploaded_bytes);
    }

    /// 分片确认后更新进度，百分比与字节数都不回退
    pub(crate) fn advance(&mut self, uploaded_bytes: u64, percent: f64) {
        self.uploaded_bytes = self.uploaded_bytes.max(uploaded_bytes);
        self.percent = self.percent.max(percent);
        self.speed.record(self.uploaded_bytes);
    }

    pub(crate) fn record_retry(&mut self, attempt: u32, error: &UploadError) {
        self.retry_count += 1;
        self.last_error = Some(error.clone());
        self.observer.on_retry(attempt, error);
    }

    pub(crate) fn set_last_error(&mut self, error: &UploadError) {
        self.last_error = Some(error.clone());
    }

    pub(crate) fn chunk_complete(&self, index: u32, total: u32) {
        self.observer.on_chunk_complete(index, total);
    }

    pub(crate) fn snapshot(&self, stage: UploadStage) -> ProgressSnapshot {
        let remaining = self.total_bytes.saturating_sub(self.uploaded_bytes);
        let estimated_remaining_ms = match stage {
            UploadStage::Uploading | UploadStage::Retrying => self.speed.eta_ms(remaining),
            UploadStage::Completed => Some(0),
            _ => None,
        };
        ProgressSnapshot {
            session_id: self.session_id.clone(),
            stage,
            progress_percent: self.percent,
            uploaded_bytes: self.uploaded_bytes,
            total_bytes: self.total_bytes,
            upload_speed_bytes_per_sec: self.speed.speed(),
            estimated_remaining_ms,
            retry_count: self.retry_count,
            last_error: self.last_error.clone(),
        }
    }

    /// 发送快照；终止阶段之后不再发送
    pub(crate) fn emit(&mut self, stage: UploadStage) {
        if self.last_stage.map(|s| s.is_terminal()).unwrap_or(false) {
            return;
        }
        if stage == UploadStage::Completed {
            self.percent = 100.0;
            self.uploaded_bytes = self.total_bytes;
        }
        let snapshot = self.snapshot(stage);
        self.last_stage = Some(stage);
        self.observer.on_progress(&snapshot);
    }
}
