// 上传引擎
//
// 单个文件的完整上传流程：
// 1. 准备：大小预检、计算文件哈希
// 2. 建立会话：发起新会话或续传已有会话
// 3. 逐个发送剩余分片（升序，同一时刻只有一个请求在途）
// 4. 完成：服务器确认组装，返回远端地址
//
// 建立会话、发送分片、完成这三个网络步骤都受重试策略保护；
// 取消在任何非终止状态都会立即生效，最后一个进度事件一定是 cancelled。

use crate::api::client::UploadApi;
use crate::api::types::{ChunkAck, InitiateRequest};
use crate::uploader::chunk::ChunkTransmitter;
use crate::uploader::error::{UploadError, UploadErrorKind};
use crate::uploader::hash::HashComputer;
use crate::uploader::progress::ProgressReporter;
use crate::uploader::session::{SessionStatus, TransferSession};
use crate::uploader::task::{OrchestratorState, UploadOptions, UploadResult, UploadSource};
use chrono::Utc;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

// =====================================================
// 上传引擎
// =====================================================

/// 上传引擎
///
/// 无内部可变状态，可在多个并发上传之间共享；
/// 每次 [`UploadEngine::upload`] 都是独立的会话
#[derive(Clone)]
pub struct UploadEngine {
    api: UploadApi,
}

impl UploadEngine {
    pub fn new(api: UploadApi) -> Self {
        Self { api }
    }

    pub fn api(&self) -> &UploadApi {
        &self.api
    }

    /// 上传单个文件
    ///
    /// # 参数
    /// * `source` - 待上传文件
    /// * `options` - 上传选项（重试、观察者、取消令牌、续传会话）
    ///
    /// # 返回
    /// 成功时返回会话 ID、远端地址、文件大小和完成时间；
    /// 失败时返回最后一次分类后的错误
    pub async fn upload(
        &self,
        source: &UploadSource,
        options: &UploadOptions,
    ) -> Result<UploadResult, UploadError> {
        options.validate()?;
        // 每次上传一个 run id，便于在日志中串联同一次上传
        let span = info_span!("upload", run = %Uuid::new_v4(), file = %source.filename);
        let mut run = UploadRun::new(self.api.clone(), source, options);
        run.execute().instrument(span).await
    }
}

// =====================================================
// 单次上传
// =====================================================

struct UploadRun<'a> {
    api: UploadApi,
    source: &'a UploadSource,
    options: &'a UploadOptions,
    state: OrchestratorState,
    reporter: ProgressReporter,
}

impl<'a> UploadRun<'a> {
    fn new(api: UploadApi, source: &'a UploadSource, options: &'a UploadOptions) -> Self {
        Self {
            api,
            source,
            options,
            state: OrchestratorState::Preparing,
            reporter: ProgressReporter::new(options.observer.clone(), 0),
        }
    }

    async fn execute(&mut self) -> Result<UploadResult, UploadError> {
        let mut slot: Option<TransferSession> = None;
        let result = self.drive(&mut slot).await;

        match result {
            Ok(result) => {
                self.transition(OrchestratorState::Completed);
                self.emit_stage();
                info!(
                    "上传完成: {} -> {} (session={}, {} bytes)",
                    self.source.filename, result.remote_url, result.session_id, result.size
                );
                Ok(result)
            }
            Err(e) if e.is_cancelled() || self.options.cancellation.is_cancelled() => {
                self.finish_cancelled(slot.as_mut()).await;
                Err(UploadError::cancelled())
            }
            Err(e) => {
                if let Some(session) = slot.as_mut() {
                    if e.kind == UploadErrorKind::SessionExpired {
                        session.mark_expired();
                    }
                }
                self.transition(OrchestratorState::Failed);
                self.reporter.set_last_error(&e);
                self.emit_stage();
                error!(
                    "上传失败: {} (session={}): {}",
                    self.source.filename,
                    slot.as_ref().map(|s| s.session_id.as_str()).unwrap_or("-"),
                    e
                );
                Err(e)
            }
        }
    }

    /// 主流程，会话建立后放入 slot 以便失败/取消时处理
    async fn drive(
        &mut self,
        slot: &mut Option<TransferSession>,
    ) -> Result<UploadResult, UploadError> {
        let cancel = self.options.cancellation.clone();

        // ---------- 准备 ----------
        cancel.check()?;
        let file_size = self.precheck_size().await?;
        self.reporter = ProgressReporter::new(self.options.observer.clone(), file_size);
        self.emit_stage();

        let file_hash = cancel
            .run(HashComputer::digest_file(&self.source.path, &cancel))
            .await??;
        debug!("文件哈希: {} -> {}", self.source.filename, file_hash);

        // ---------- 建立会话 ----------
        self.transition(OrchestratorState::OpeningSession);
        let mut attempt = 0;
        let session = loop {
            match self.open_session(file_size, &file_hash).await {
                Ok(session) => break session,
                Err(e) => {
                    self.retry_or_fail(e, &mut attempt, OrchestratorState::OpeningSession)
                        .await?
                }
            }
        };
        let session = slot.insert(session);
        session.mark_in_progress()?;

        info!(
            "会话已建立: {} (session={}, 分片 {}x{} bytes, 已上传 {}/{})",
            self.source.filename,
            session.session_id,
            session.total_chunks,
            session.chunk_size,
            session.uploaded_chunks().len(),
            session.total_chunks
        );

        // 新会话从 0% 开始；续传会话从服务器记录的进度开始
        self.transition(OrchestratorState::Transmitting);
        self.reporter.begin_session(
            &session.session_id,
            session.uploaded_bytes(),
            session.progress_percent(),
        );
        self.emit_stage();

        // ---------- 发送分片 ----------
        let transmitter = ChunkTransmitter::new(self.api.clone(), self.source.path.clone());
        let mut last_ack: Option<ChunkAck> = None;

        while let Some(index) = session.next_remaining() {
            let mut attempt = 0;
            let ack = loop {
                ensure_not_expired(session)?;
                match transmitter
                    .transmit(session, index, attempt + 1, &cancel)
                    .await
                {
                    Ok(ack) => break ack,
                    Err(e) => {
                        self.retry_or_fail(e, &mut attempt, OrchestratorState::Transmitting)
                            .await?
                    }
                }
            };

            session.apply_ack(&ack)?;
            self.reporter
                .advance(session.uploaded_bytes(), session.progress_percent());
            self.reporter.chunk_complete(index, session.total_chunks);
            self.emit_stage();
            last_ack = Some(ack);
        }

        // ---------- 完成 ----------
        self.transition(OrchestratorState::Finalizing);
        self.emit_stage();

        if let Some(ack) = last_ack.filter(|a| a.is_implicitly_completed()) {
            debug!("最后一个分片已触发服务器组装，跳过显式完成调用");
            session.mark_completed()?;
            return Ok(UploadResult {
                session_id: session.session_id.clone(),
                remote_url: ack.file_url.unwrap_or_default(),
                size: ack.file_size.unwrap_or(session.file_size),
                completed_at: ack.completed_at.unwrap_or_else(Utc::now),
            });
        }

        let mut attempt = 0;
        let finalized = loop {
            cancel.check()?;
            match self
                .api
                .finalize(&session.session_id, &file_hash, &cancel)
                .await
            {
                Ok(resp) => break resp,
                Err(e) => {
                    self.retry_or_fail(e, &mut attempt, OrchestratorState::Finalizing)
                        .await?
                }
            }
        };

        if finalized.status != SessionStatus::Completed {
            return Err(UploadError::protocol(format!(
                "完成调用返回的状态不是 completed: {:?}",
                finalized.status
            )));
        }
        if finalized.file_size != session.file_size {
            warn!(
                "服务器确认的文件大小与本地不一致: 本地={}, 服务器={}",
                session.file_size, finalized.file_size
            );
        }
        session.mark_completed()?;

        Ok(UploadResult {
            session_id: finalized.session_id,
            remote_url: finalized.file_url,
            size: finalized.file_size,
            completed_at: finalized.completed_at,
        })
    }

    /// 读取文件大小并做上限预检
    async fn precheck_size(&self) -> Result<u64, UploadError> {
        let meta = tokio::fs::metadata(&self.source.path).await.map_err(|e| {
            UploadError::validation(format!("无法读取文件 {:?}: {}", self.source.path, e))
        })?;
        if !meta.is_file() {
            return Err(UploadError::validation(format!(
                "{:?} 不是普通文件",
                self.source.path
            )));
        }

        let file_size = meta.len();
        if let Some(max) = self.options.max_file_size {
            if file_size > max {
                return Err(UploadError::new(
                    UploadErrorKind::FileTooLarge,
                    format!("文件大小 {} bytes 超过上限 {} bytes", file_size, max),
                ));
            }
        }
        Ok(file_size)
    }

    /// 发起新会话或恢复已有会话
    async fn open_session(
        &self,
        file_size: u64,
        file_hash: &str,
    ) -> Result<TransferSession, UploadError> {
        let cancel = &self.options.cancellation;
        cancel.check()?;

        if !cancel.run(self.api.check_connectivity()).await? {
            return Err(UploadError::new(
                UploadErrorKind::NetworkError,
                "网络不可用，连通性预检失败",
            ));
        }

        match &self.options.resume_session_id {
            Some(session_id) => {
                info!("续传会话: {}", session_id);
                let resp = self.api.status(session_id, cancel).await?;
                TransferSession::from_status(resp, file_size)
            }
            None => {
                let request = InitiateRequest {
                    filename: self.source.filename.clone(),
                    file_size,
                    mime_type: self.source.mime_type.clone(),
                    file_hash: file_hash.to_string(),
                    chunk_size: self.options.chunk_size_hint(),
                    metadata: self.source.metadata.clone(),
                };
                let resp = self.api.initiate(&request, cancel).await?;
                TransferSession::from_initiate(resp, file_size)
            }
        }
    }

    /// 判定是否重试；需要重试时等待退避延迟后回到原步骤，否则返回错误
    ///
    /// # 参数
    /// * `error` - 本次失败的错误
    /// * `attempt` - 当前步骤已重试次数，重试时加 1
    /// * `resume` - 等待结束后回到的状态
    async fn retry_or_fail(
        &mut self,
        error: UploadError,
        attempt: &mut u32,
        resume: OrchestratorState,
    ) -> Result<(), UploadError> {
        if error.is_cancelled() || !self.options.retry.should_retry(&error, *attempt) {
            return Err(error);
        }

        *attempt += 1;
        let delay = self.options.retry.delay(*attempt);
        warn!(
            "{} 失败，等待 {:?} 后重试 ({}/{}): {}",
            self.source.filename, delay, *attempt, self.options.retry.max_retries, error
        );

        self.transition(OrchestratorState::Retrying);
        self.reporter.record_retry(*attempt, &error);
        self.emit_stage();

        self.options.cancellation.sleep(delay).await?;
        self.transition(resume);
        Ok(())
    }

    /// 取消收尾：会话置为 CANCELLED，尽力通知服务器，最后发出 cancelled 事件
    async fn finish_cancelled(&mut self, session: Option<&mut TransferSession>) {
        self.transition(OrchestratorState::Cancelled);
        self.emit_stage();
        info!("上传已取消: {}", self.source.filename);

        let Some(session) = session else {
            return;
        };
        if !session.mark_cancelled() {
            return;
        }

        let session_id = session.session_id.clone();
        match tokio::time::timeout(
            self.options.cancel_timeout,
            self.api.cancel_session(&session_id),
        )
        .await
        {
            Ok(Ok(())) => debug!("已通知服务器释放会话: {}", session_id),
            Ok(Err(e)) => warn!("通知服务器取消会话失败（忽略）: {}: {}", session_id, e),
            Err(_) => warn!(
                "通知服务器取消会话超时（忽略）: {} ({:?})",
                session_id, self.options.cancel_timeout
            ),
        }
    }

    /// 按当前状态上报进度
    fn emit_stage(&mut self) {
        self.reporter.emit(self.state.stage());
    }

    fn transition(&mut self, next: OrchestratorState) {
        if !self.state.can_transition_to(next) {
            warn!("非预期的状态转移: {:?} -> {:?}", self.state, next);
        }
        debug!("{}: {:?} -> {:?}", self.source.filename, self.state, next);
        self.state = next;
    }
}

/// 本地过期检查
fn ensure_not_expired(session: &mut TransferSession) -> Result<(), UploadError> {
    if session.is_expired_at(Utc::now()) {
        session.mark_expired();
        return Err(UploadError::new(
            UploadErrorKind::SessionExpired,
            format!(
                "会话 {} 已于 {} 过期，需要重新发起",
                session.session_id, session.expires_at
            ),
        ));
    }
    Ok(())
}
