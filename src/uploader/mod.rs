// 上传引擎模块
//
// 单文件分片上传：会话协议、分片发送、重试退避、错误分类、
// 进度上报和取消。

pub mod cancel;
pub mod chunk;
pub mod engine;
pub mod error;
pub mod hash;
pub mod progress;
pub mod retry;
pub mod session;
pub mod task;

pub use cancel::CancellationController;
pub use chunk::{
    normalize_chunk_size_hint, ChunkTransmitter, UploadChunk, DEFAULT_CHUNK_SIZE_HINT,
    MAX_CHUNK_SIZE_HINT, MIN_CHUNK_SIZE_HINT,
};
pub use engine::UploadEngine;
pub use error::{UploadError, UploadErrorKind};
pub use hash::HashComputer;
pub use progress::{
    ChannelObserver, NoopObserver, ProgressObserver, ProgressSnapshot, SpeedTracker, UploadEvent,
    UploadStage,
};
pub use retry::{
    backoff_delay_ms, should_retry, RetryPolicy, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_MAX_RETRIES,
    DEFAULT_RETRY_DELAY_MS,
};
pub use session::{chunk_count, SessionStatus, TransferSession};
pub use task::{
    OrchestratorState, UploadOptions, UploadResult, UploadSource, DEFAULT_CANCEL_TIMEOUT,
};
