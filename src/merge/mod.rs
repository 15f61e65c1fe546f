// 三段陈述视频合并上传
//
// 三段分别上传（或一次性提交）后由服务器合并为一个视频，
// 并返回每段在结果中的时间范围。

pub mod coordinator;
pub mod segments;
pub mod types;

pub use coordinator::{validate_clips, MergeCoordinator};
pub use segments::{expected_segments, validate_segments, validate_segments_for};
pub use types::{
    ClipProgress, MergeError, MergeMode, MergeObserver, MergeOptions, MergeProgress, MergeStage,
    MergeStatus, MergeUpload, MergedAsset, NoopMergeObserver, PollPolicy, SegmentMetadata,
    StatementClip, DEFAULT_MAX_POLL_ATTEMPTS, DEFAULT_MAX_POLL_INTERVAL_MS,
    DEFAULT_POLL_BACKOFF_MULTIPLIER, DEFAULT_POLL_INTERVAL_MS, STATEMENT_COUNT,
};
