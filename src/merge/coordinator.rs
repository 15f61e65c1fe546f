// 三段合并上传协调器
//
// 流程：
// 1. 校验恰好三段（在任何网络请求之前）
// 2. 三段并发上传，各自独立的会话和子取消令牌；任一段最终失败即取消其余两段
// 3. 三段都完成后发起合并（或 combined 模式下一次性提交三段）
// 4. 轮询合并状态直到 completed/failed
// 5. 校验分段元数据

use crate::api::transport::FilePart;
use crate::api::types::{MergeClipRef, MergeInitiateRequest, MergeStatusResponse};
use crate::merge::segments::{expected_segments, validate_segments_for};
use crate::merge::types::{
    ClipProgress, MergeError, MergeMode, MergeObserver, MergeOptions, MergeProgress, MergeStage,
    MergeStatus, MergeUpload, MergedAsset, StatementClip, STATEMENT_COUNT,
};
use crate::uploader::engine::UploadEngine;
use crate::uploader::error::{UploadError, UploadErrorKind};
use crate::uploader::progress::{ProgressObserver, ProgressSnapshot, UploadStage};
use crate::uploader::task::{UploadResult, UploadSource};
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 三段合并上传协调器
#[derive(Clone)]
pub struct MergeCoordinator {
    engine: UploadEngine,
}

impl MergeCoordinator {
    pub fn new(engine: UploadEngine) -> Self {
        Self { engine }
    }

    /// 上传三段陈述视频并等待服务器合并
    ///
    /// # 参数
    /// * `clips` - 恰好三段，序号互不相同，顺序不限
    /// * `options` - 合并选项
    pub async fn upload_and_merge(
        &self,
        clips: Vec<StatementClip>,
        options: &MergeOptions,
    ) -> Result<MergedAsset, MergeError> {
        validate_clips(&clips)?;
        options.upload.validate()?;

        let mut clips = clips;
        clips.sort_by_key(|c| c.statement_index);

        let tracker = Arc::new(MergeTracker::new(&clips, options.observer.clone()));
        let result = self.run(&clips, options, &tracker).await;

        match &result {
            Ok(asset) => {
                tracker.set_stage(MergeStage::Completed, Some(MergeStatus::Completed));
                info!(
                    "合并完成: {} -> {}",
                    asset.merge_session_id, asset.merged_video_url
                );
            }
            Err(e) if e.is_cancelled() || options.cancellation.is_cancelled() => {
                tracker.set_stage(MergeStage::Cancelled, None);
                info!("合并上传已取消");
            }
            Err(e) => {
                tracker.set_stage(MergeStage::Failed, None);
                warn!("合并上传失败: {}", e);
            }
        }

        match result {
            Err(e) if options.cancellation.is_cancelled() && !e.is_cancelled() => {
                Err(UploadError::cancelled().into())
            }
            other => other,
        }
    }

    async fn run(
        &self,
        clips: &[StatementClip],
        options: &MergeOptions,
        tracker: &Arc<MergeTracker>,
    ) -> Result<MergedAsset, MergeError> {
        let cancel = &options.cancellation;
        let api = self.engine.api();

        // ---------- 上传并发起合并 ----------
        let mut merge = match options.mode {
            MergeMode::Sessions => {
                let uploads = self.upload_clips(clips, options, tracker).await?;
                let request = MergeInitiateRequest {
                    clips: clips
                        .iter()
                        .zip(uploads.iter())
                        .map(|(clip, upload)| MergeClipRef {
                            statement_index: clip.statement_index,
                            session_id: upload.session_id.clone(),
                            duration_ms: clip.duration_ms,
                        })
                        .collect(),
                    metadata: options.metadata.clone(),
                };

                tracker.set_stage(MergeStage::Merging, Some(MergeStatus::Pending));
                let resp = with_retry(options, "发起合并", || api.merge_initiate(&request, cancel))
                    .await?;
                info!("已发起合并: {}", resp.merge_session_id);
                MergeUpload::new(resp.merge_session_id, uploads)
            }
            MergeMode::Combined => {
                let (fields, parts) = build_combined_parts(clips, options).await?;
                tracker.set_stage(MergeStage::Uploading, None);
                let resp = with_retry(options, "提交合并", || {
                    api.merge_combined(fields.clone(), parts.clone(), cancel)
                })
                .await?;
                tracker.mark_all_uploaded();
                tracker.set_stage(MergeStage::Merging, Some(MergeStatus::Pending));
                info!("三段已一次性提交，合并会话: {}", resp.merge_session_id);
                MergeUpload::new(resp.merge_session_id, Vec::new())
            }
        };

        // ---------- 轮询 ----------
        self.poll_until_terminal(&mut merge, options, tracker).await?;

        if merge.status == MergeStatus::Failed {
            return Err(UploadError::new(
                UploadErrorKind::ServerError,
                format!("服务器合并失败: {}", merge.merge_session_id),
            )
            .into());
        }

        // ---------- 校验分段 ----------
        if merge.segment_metadata.is_empty() {
            return Err(UploadError::protocol(format!(
                "合并 {} 已完成但没有分段元数据",
                merge.merge_session_id
            ))
            .into());
        }
        validate_segments_for(&merge.segment_metadata, clips)?;
        if merge.segment_metadata != expected_segments(clips) {
            debug!(
                "服务器分段与本地时长推算不一致（以服务器为准）: {:?}",
                merge.segment_metadata
            );
        }

        let merged_video_url = merge.merged_video_url.clone().ok_or_else(|| {
            UploadError::protocol(format!(
                "合并 {} 已完成但没有返回视频地址",
                merge.merge_session_id
            ))
        })?;

        Ok(MergedAsset {
            merge_session_id: merge.merge_session_id,
            merged_video_url,
            segments: merge.segment_metadata,
            clips: merge.clips,
        })
    }

    /// 并发上传三段，任一段最终失败立即取消其余两段
    ///
    /// 返回按 statement_index 升序的上传结果
    async fn upload_clips(
        &self,
        clips: &[StatementClip],
        options: &MergeOptions,
        tracker: &Arc<MergeTracker>,
    ) -> Result<Vec<UploadResult>, MergeError> {
        let group = options.cancellation.child();

        let mut pending: FuturesUnordered<_> = clips
            .iter()
            .enumerate()
            .map(|(slot, clip)| {
                let engine = self.engine.clone();
                let source = UploadSource::from_path(&clip.path).with_metadata(json!({
                    "statementIndex": clip.statement_index,
                    "durationMs": clip.duration_ms,
                }));
                let mut upload = options.upload.clone();
                upload.observer = Arc::new(ClipObserver {
                    slot,
                    tracker: tracker.clone(),
                });
                upload.cancellation = group.child();
                upload.resume_session_id = None;

                async move { (slot, engine.upload(&source, &upload).await) }
            })
            .collect();

        let mut results: Vec<Option<UploadResult>> = vec![None; clips.len()];
        let mut failure: Option<(u8, UploadError)> = None;

        while let Some((slot, result)) = pending.next().await {
            match result {
                Ok(upload) => {
                    debug!(
                        "陈述 #{} 上传完成: {}",
                        clips[slot].statement_index, upload.session_id
                    );
                    results[slot] = Some(upload);
                }
                Err(e) => {
                    if failure.is_none() {
                        if !e.is_cancelled() {
                            warn!(
                                "陈述 #{} 上传失败，取消其余上传: {}",
                                clips[slot].statement_index, e
                            );
                        }
                        failure = Some((clips[slot].statement_index, e));
                        group.cancel();
                    }
                }
            }
        }

        if let Some((statement_index, error)) = failure {
            if error.is_cancelled() {
                return Err(MergeError::Merge(error));
            }
            return Err(MergeError::ClipFailed {
                statement_index,
                error,
            });
        }

        results
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| UploadError::protocol("上传结果缺失").into())
    }

    /// 轮询合并状态直到终止
    ///
    /// 可重试的查询错误只消耗轮询次数，不中断轮询
    async fn poll_until_terminal(
        &self,
        merge: &mut MergeUpload,
        options: &MergeOptions,
        tracker: &Arc<MergeTracker>,
    ) -> Result<(), MergeError> {
        let cancel = &options.cancellation;
        let policy = &options.poll;

        for poll in 1..=policy.max_attempts {
            cancel.sleep(policy.delay(poll)).await?;

            let resp: MergeStatusResponse = match self
                .engine
                .api()
                .merge_status(&merge.merge_session_id, cancel)
                .await
            {
                Ok(resp) => resp,
                Err(e) if e.retryable() => {
                    warn!("查询合并状态失败（第 {} 次），继续轮询: {}", poll, e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if let Some(reason) = &resp.error {
                debug!("合并状态附带信息: {}", reason);
            }
            merge.apply_status(&resp);
            debug!("合并 {} 状态: {:?}", merge.merge_session_id, merge.status);

            if merge.status.is_terminal() {
                if merge.status == MergeStatus::Failed {
                    if let Some(reason) = resp.error {
                        return Err(UploadError::new(
                            UploadErrorKind::ServerError,
                            format!("服务器合并失败: {}", reason),
                        )
                        .into());
                    }
                }
                return Ok(());
            }
            tracker.set_stage(MergeStage::Merging, Some(merge.status));
        }

        Err(UploadError::new(
            UploadErrorKind::TimeoutError,
            format!(
                "合并 {} 在 {} 次轮询后仍未完成",
                merge.merge_session_id, policy.max_attempts
            ),
        )
        .into())
    }
}

/// 校验三段输入：数量、序号唯一、时长非零
pub fn validate_clips(clips: &[StatementClip]) -> Result<(), UploadError> {
    if clips.len() != STATEMENT_COUNT {
        return Err(UploadError::validation(format!(
            "合并上传需要恰好 {} 段视频，实际 {} 段",
            STATEMENT_COUNT,
            clips.len()
        )));
    }

    let indices: BTreeSet<u8> = clips.iter().map(|c| c.statement_index).collect();
    if indices.len() != clips.len() {
        return Err(UploadError::validation("陈述序号重复"));
    }

    if let Some(clip) = clips.iter().find(|c| c.duration_ms == 0) {
        return Err(UploadError::validation(format!(
            "陈述 #{} 的时长为 0",
            clip.statement_index
        )));
    }
    Ok(())
}

/// 合并请求的重试包装，与上传使用同一重试策略
async fn with_retry<T, F, Fut>(options: &MergeOptions, what: &str, mut call: F) -> Result<T, UploadError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, UploadError>>,
{
    let policy = &options.upload.retry;
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_cancelled() && policy.should_retry(&e, attempt) => {
                attempt += 1;
                let delay = policy.delay(attempt);
                warn!("{}失败，等待 {:?} 后重试 ({}/{}): {}", what, delay, attempt, policy.max_retries, e);
                options.cancellation.sleep(delay).await?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// combined 模式的 multipart 字段和文件部分
///
/// 大小在读取前按元数据检查；读取或检查失败归到对应陈述序号。
async fn build_combined_parts(
    clips: &[StatementClip],
    options: &MergeOptions,
) -> Result<(Vec<(String, String)>, Vec<FilePart>), MergeError> {
    let mut parts = Vec::with_capacity(clips.len());
    let mut manifest = Vec::with_capacity(clips.len());

    for clip in clips {
        options.cancellation.check()?;
        let clip_failed = |error: UploadError| MergeError::ClipFailed {
            statement_index: clip.statement_index,
            error,
        };
        let unreadable = |e: std::io::Error| {
            clip_failed(UploadError::validation(format!(
                "无法读取陈述 #{} 的文件 {:?}: {}",
                clip.statement_index, clip.path, e
            )))
        };

        let size = tokio::fs::metadata(&clip.path).await.map_err(unreadable)?.len();
        if let Some(max) = options.upload.max_file_size {
            if size > max {
                return Err(clip_failed(UploadError::new(
                    UploadErrorKind::FileTooLarge,
                    format!(
                        "陈述 #{} 的文件大小 {} bytes 超过上限 {} bytes",
                        clip.statement_index, size, max
                    ),
                )));
            }
        }
        let data = tokio::fs::read(&clip.path).await.map_err(unreadable)?;

        let source = UploadSource::from_path(&clip.path);
        manifest.push(json!({
            "statementIndex": clip.statement_index,
            "durationMs": clip.duration_ms,
            "filename": source.filename,
        }));
        parts.push(FilePart {
            field: format!("video_{}", clip.statement_index),
            file_name: source.filename,
            mime_type: source.mime_type,
            data: Bytes::from(data),
        });
    }

    let mut fields = vec![("clips".to_string(), serde_json::Value::Array(manifest).to_string())];
    if let Some(metadata) = &options.metadata {
        fields.push(("metadata".to_string(), metadata.to_string()));
    }
    Ok((fields, parts))
}

// =====================================================
// 进度聚合
// =====================================================

struct TrackerState {
    stage: MergeStage,
    clips: Vec<ClipProgress>,
    merge_status: Option<MergeStatus>,
    percent: f64,
}

impl TrackerState {
    /// 终止后不再更新
    fn is_terminal(&self) -> bool {
        matches!(
            self.stage,
            MergeStage::Completed | MergeStage::Cancelled | MergeStage::Failed
        )
    }
}

/// 三段进度按字节加权汇总
struct MergeTracker {
    state: Mutex<TrackerState>,
    observer: Arc<dyn MergeObserver>,
}

impl MergeTracker {
    fn new(clips: &[StatementClip], observer: Arc<dyn MergeObserver>) -> Self {
        let clips = clips
            .iter()
            .map(|c| ClipProgress {
                statement_index: c.statement_index,
                stage: UploadStage::Preparing,
                progress_percent: 0.0,
                uploaded_bytes: 0,
                total_bytes: 0,
            })
            .collect();
        Self {
            state: Mutex::new(TrackerState {
                stage: MergeStage::Uploading,
                clips,
                merge_status: None,
                percent: 0.0,
            }),
            observer,
        }
    }

    fn update_clip(&self, slot: usize, snapshot: &ProgressSnapshot) {
        let progress = {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return;
            }
            if let Some(clip) = state.clips.get_mut(slot) {
                clip.stage = snapshot.stage;
                clip.progress_percent = snapshot.progress_percent;
                clip.uploaded_bytes = snapshot.uploaded_bytes;
                clip.total_bytes = snapshot.total_bytes;
            }
            Self::snapshot(&mut state)
        };
        self.observer.on_progress(&progress);
    }

    fn mark_all_uploaded(&self) {
        let progress = {
            let mut state = self.state.lock();
            for clip in state.clips.iter_mut() {
                clip.stage = UploadStage::Completed;
                clip.progress_percent = 100.0;
                clip.uploaded_bytes = clip.total_bytes;
            }
            state.percent = 100.0;
            Self::snapshot(&mut state)
        };
        self.observer.on_progress(&progress);
    }

    fn set_stage(&self, stage: MergeStage, merge_status: Option<MergeStatus>) {
        let progress = {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return;
            }
            state.stage = stage;
            if merge_status.is_some() {
                state.merge_status = merge_status;
            }
            Self::snapshot(&mut state)
        };
        self.observer.on_progress(&progress);
    }

    fn snapshot(state: &mut TrackerState) -> MergeProgress {
        let uploaded_bytes: u64 = state.clips.iter().map(|c| c.uploaded_bytes).sum();
        let total_bytes: u64 = state.clips.iter().map(|c| c.total_bytes).sum();
        let all_known = state.clips.iter().all(|c| c.total_bytes > 0 || c.stage == UploadStage::Completed);

        let weighted = if total_bytes > 0 && all_known {
            uploaded_bytes as f64 / total_bytes as f64 * 100.0
        } else {
            // 文件大小未全部获知时按段平均
            state.clips.iter().map(|c| c.progress_percent).sum::<f64>() / state.clips.len().max(1) as f64
        };
        state.percent = state.percent.max(weighted);

        MergeProgress {
            stage: state.stage,
            progress_percent: state.percent,
            uploaded_bytes,
            total_bytes,
            clips: state.clips.clone(),
            merge_status: state.merge_status,
        }
    }
}

/// 单段上传进度转发到汇总器
struct ClipObserver {
    slot: usize,
    tracker: Arc<MergeTracker>,
}

impl ProgressObserver for ClipObserver {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        self.tracker.update_clip(self.slot, snapshot);
    }
}
