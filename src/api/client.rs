// 上传后端客户端
//
// 所有后端调用都经过 execute()：附加令牌、单次超时与取消竞争、
// 原始结果在这里一次性分类为 UploadError。

use crate::api::transport::{ApiRequest, ApiResponse, FilePart, Transport, TransportError};
use crate::api::types::{
    ChunkAck, ErrorBody, FinalizeResponse, InitiateRequest, InitiateResponse,
    MergeInitiateRequest, MergeInitiateResponse, MergeStatusResponse, ServerReply,
    SessionStatusResponse,
};
use crate::uploader::cancel::CancellationController;
use crate::uploader::error::{looks_like_hash_mismatch, UploadError, UploadErrorKind};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// 默认单次请求超时: 30 秒
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const INITIATE_PATH: &str = "/api/uploads/initiate";
const MERGE_PATH: &str = "/api/uploads/merge";
const MERGE_COMBINED_PATH: &str = "/api/uploads/merge/combined";

/// 错误信息最长保留字节数
const MAX_ERROR_TEXT_LEN: usize = 512;

/// 上传后端客户端
#[derive(Clone)]
pub struct UploadApi {
    transport: Arc<dyn Transport>,
    request_timeout: Duration,
}

impl UploadApi {
    /// 创建客户端
    ///
    /// # 参数
    /// * `transport` - 传输能力（HTTP 实现或测试替身）
    /// * `request_timeout` - 单次请求超时
    pub fn new(transport: Arc<dyn Transport>, request_timeout: Duration) -> Self {
        Self {
            transport,
            request_timeout,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// 连通性预检
    pub async fn check_connectivity(&self) -> bool {
        self.transport.check_connectivity().await
    }

    /// 发起上传会话
    pub async fn initiate(
        &self,
        request: &InitiateRequest,
        cancel: &CancellationController,
    ) -> Result<InitiateResponse, UploadError> {
        let body = serde_json::to_value(request)
            .map_err(|e| UploadError::validation(format!("序列化发起请求失败: {}", e)))?;
        let resp = self
            .execute(ApiRequest::post(INITIATE_PATH).json(body), cancel)
            .await?;
        decode(resp)
    }

    /// 上传单个分片
    ///
    /// # 参数
    /// * `path` - 会话内的分片提交路径
    /// * `session_id` - 会话 ID
    /// * `chunk_index` - 分片索引
    /// * `chunk_hash` - 分片哈希
    /// * `data` - 分片数据
    pub async fn upload_chunk(
        &self,
        path: &str,
        session_id: &str,
        chunk_index: u32,
        chunk_hash: &str,
        data: Vec<u8>,
        cancel: &CancellationController,
    ) -> Result<ChunkAck, UploadError> {
        let request = ApiRequest::post(path)
            .header("Content-Type", "application/octet-stream")
            .header("X-Session-Id", session_id)
            .header("X-Chunk-Index", chunk_index.to_string())
            .header("X-Chunk-Hash", chunk_hash)
            .bytes(data);
        let resp = self.execute(request, cancel).await?;
        decode(resp)
    }

    /// 显式完成上传（服务器组装分片）
    pub async fn finalize(
        &self,
        session_id: &str,
        file_hash: &str,
        cancel: &CancellationController,
    ) -> Result<FinalizeResponse, UploadError> {
        let path = format!("/api/uploads/{}/complete", urlencoding::encode(session_id));
        let body = json!({ "sessionId": session_id, "fileHash": file_hash });
        let resp = self.execute(ApiRequest::post(path).json(body), cancel).await?;
        decode(resp)
    }

    /// 查询会话状态
    pub async fn status(
        &self,
        session_id: &str,
        cancel: &CancellationController,
    ) -> Result<SessionStatusResponse, UploadError> {
        let path = format!("/api/uploads/{}/status", urlencoding::encode(session_id));
        let resp = self.execute(ApiRequest::get(path), cancel).await?;
        decode(resp)
    }

    /// 通知服务器释放会话
    ///
    /// 调用方已取消，这里使用独立的令牌，只受超时约束
    pub async fn cancel_session(&self, session_id: &str) -> Result<(), UploadError> {
        let path = format!("/api/uploads/{}", urlencoding::encode(session_id));
        let resp = self
            .execute(ApiRequest::delete(path), &CancellationController::new())
            .await?;
        if resp.is_success() {
            Ok(())
        } else {
            Err(classify_rejection(resp.status, &resp.body))
        }
    }

    /// 以三个已完成的会话发起合并
    pub async fn merge_initiate(
        &self,
        request: &MergeInitiateRequest,
        cancel: &CancellationController,
    ) -> Result<MergeInitiateResponse, UploadError> {
        let body = serde_json::to_value(request)
            .map_err(|e| UploadError::validation(format!("序列化合并请求失败: {}", e)))?;
        let resp = self.execute(ApiRequest::post(MERGE_PATH).json(body), cancel).await?;
        decode(resp)
    }

    /// 三段视频作为一个 multipart 请求提交并发起合并
    pub async fn merge_combined(
        &self,
        fields: Vec<(String, String)>,
        parts: Vec<FilePart>,
        cancel: &CancellationController,
    ) -> Result<MergeInitiateResponse, UploadError> {
        let request = ApiRequest::post(MERGE_COMBINED_PATH).multipart(fields, parts);
        let resp = self.execute(request, cancel).await?;
        decode(resp)
    }

    /// 查询合并状态
    pub async fn merge_status(
        &self,
        merge_session_id: &str,
        cancel: &CancellationController,
    ) -> Result<MergeStatusResponse, UploadError> {
        let path = format!(
            "{}/{}/status",
            MERGE_PATH,
            urlencoding::encode(merge_session_id)
        );
        let resp = self.execute(ApiRequest::get(path), cancel).await?;
        decode(resp)
    }

    /// 执行请求
    ///
    /// 网络请求与超时定时器、取消信号竞争，先完成者胜出，其余分支随之被丢弃
    async fn execute(
        &self,
        request: ApiRequest,
        cancel: &CancellationController,
    ) -> Result<ApiResponse, UploadError> {
        cancel.check()?;

        let token = self
            .transport
            .current_token()
            .ok_or_else(UploadError::unauthenticated)?;
        let request = request.header("Authorization", format!("Bearer {}", token));

        let method = request.method;
        let path = request.path.clone();
        debug!("{} {} ({} bytes)", method, path, request.body_len());

        let send = self.transport.send(request);
        let result = tokio::select! {
            biased;
            _ = cancel.token().cancelled() => return Err(UploadError::cancelled()),
            result = tokio::time::timeout(self.request_timeout, send) => result,
        };

        match result {
            Err(_) => Err(UploadError::new(
                UploadErrorKind::TimeoutError,
                format!("{} {} 超过 {:?} 未响应", method, path, self.request_timeout),
            )),
            Ok(Err(e)) => {
                warn!("{} {} 传输失败: {}", method, path, e);
                Err(classify_transport_error(&e))
            }
            Ok(Ok(resp)) => {
                debug!("{} {} -> {}", method, path, resp.status);
                Ok(resp)
            }
        }
    }
}

/// 解码响应
pub fn decode_reply<T: DeserializeOwned>(resp: ApiResponse) -> ServerReply<T> {
    if !resp.is_success() {
        let body = serde_json::from_str::<ErrorBody>(&resp.body).unwrap_or_default();
        return ServerReply::Rejected {
            status: resp.status,
            body,
            raw: resp.body,
        };
    }
    match serde_json::from_str::<T>(&resp.body) {
        Ok(value) => ServerReply::Ok(value),
        Err(e) => ServerReply::Malformed {
            status: resp.status,
            reason: e.to_string(),
        },
    }
}

fn decode<T: DeserializeOwned>(resp: ApiResponse) -> Result<T, UploadError> {
    match decode_reply(resp) {
        ServerReply::Ok(value) => Ok(value),
        ServerReply::Rejected { status, body, raw } => Err(classify_error_body(status, &body, &raw)),
        ServerReply::Malformed { status, reason } => Err(UploadError::with_status(
            UploadErrorKind::UnknownError,
            status,
            format!("无法解析响应: {}", reason),
        )),
    }
}

/// 传输层错误分类
pub fn classify_transport_error(error: &TransportError) -> UploadError {
    match error {
        TransportError::Connect(_) | TransportError::Request(_) => {
            UploadError::new(UploadErrorKind::NetworkError, error.to_string())
        }
        TransportError::Timeout(_) => {
            UploadError::new(UploadErrorKind::TimeoutError, error.to_string())
        }
    }
}

/// 非 2xx 响应分类
pub fn classify_rejection(status: u16, raw: &str) -> UploadError {
    let body = serde_json::from_str::<ErrorBody>(raw).unwrap_or_default();
    classify_error_body(status, &body, raw)
}

fn classify_error_body(status: u16, body: &ErrorBody, raw: &str) -> UploadError {
    let text = {
        let t = body.text();
        if t.is_empty() {
            truncate(raw, MAX_ERROR_TEXT_LEN)
        } else {
            t
        }
    };

    // 优先使用结构化错误码
    if let Some(kind) = body.code.as_deref().and_then(UploadErrorKind::from_code) {
        return UploadError::with_status(kind, status, text);
    }

    // 兼容旧服务端：400 + 消息中带哈希校验失败字样
    if status == 400 && looks_like_hash_mismatch(&text) {
        return UploadError::with_status(UploadErrorKind::HashMismatch, status, text);
    }

    let message = if text.is_empty() {
        format!("HTTP {}", status)
    } else {
        text
    };
    UploadError::with_status(UploadErrorKind::from_status(status), status, message)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
