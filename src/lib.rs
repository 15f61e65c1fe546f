// Statement Upload Library
// 陈述视频分片上传与合并核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 后端接口模块
pub mod api;

// 上传引擎模块
pub mod uploader;

// 三段合并模块
pub mod merge;

// 导出常用类型
pub use api::{HttpTransport, TokenStore, Transport, UploadApi};
pub use config::AppConfig;
pub use merge::{
    MergeCoordinator, MergeError, MergeMode, MergeOptions, MergeProgress, MergedAsset,
    SegmentMetadata, StatementClip,
};
pub use uploader::{
    CancellationController, ProgressObserver, ProgressSnapshot, UploadEngine, UploadError,
    UploadErrorKind, UploadOptions, UploadResult, UploadSource, UploadStage,
};
