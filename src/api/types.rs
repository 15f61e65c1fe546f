// 后端接口数据类型
//
// 所有响应在边界处解码为这里的强类型结构，解码失败即视为 UNKNOWN_ERROR，
// 不向上层传递半解析的对象。

use crate::merge::{MergeStatus, SegmentMetadata};
use crate::uploader::SessionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 发起上传会话请求
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub filename: String,
    pub file_size: u64,
    pub mime_type: String,
    pub file_hash: String,
    /// 客户端期望的分片大小（仅建议，服务器可覆盖）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// 发起上传会话响应
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    pub session_id: String,
    /// 分片提交地址模板
    pub upload_url: String,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub expires_at: DateTime<Utc>,
    /// 相同内容的会话已存在时，服务器可能直接返回已收到的分片
    #[serde(default)]
    pub uploaded_chunks: Vec<u32>,
}

/// 分片确认
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub session_id: String,
    pub chunk_index: u32,
    #[serde(default)]
    pub status: Option<SessionStatus>,
    pub uploaded_chunks: Vec<u32>,
    pub remaining_chunks: Vec<u32>,
    #[serde(default)]
    pub progress_percent: f64,
    /// 最后一个分片时服务器可能直接完成组装
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ChunkAck {
    /// 服务器是否已在此次确认中隐式完成组装
    pub fn is_implicitly_completed(&self) -> bool {
        self.status == Some(SessionStatus::Completed) && self.file_url.is_some()
    }
}

/// 完成上传响应
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub file_url: String,
    pub file_size: u64,
    pub completed_at: DateTime<Utc>,
}

/// 会话状态查询响应
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusResponse {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub progress_percent: f64,
    #[serde(default)]
    pub uploaded_chunks: Vec<u32>,
    #[serde(default)]
    pub remaining_chunks: Vec<u32>,
    // 以下字段用于断点续传
    #[serde(default)]
    pub upload_url: Option<String>,
    #[serde(default)]
    pub chunk_size: Option<u64>,
    #[serde(default)]
    pub total_chunks: Option<u32>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// 合并请求中引用的单个片段
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeClipRef {
    pub statement_index: u8,
    pub session_id: String,
    pub duration_ms: u64,
}

/// 发起合并请求
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeInitiateRequest {
    pub clips: Vec<MergeClipRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// 发起合并响应
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeInitiateResponse {
    pub merge_session_id: String,
    #[serde(default)]
    pub status: Option<MergeStatus>,
}

/// 合并状态查询响应
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeStatusResponse {
    #[serde(default)]
    pub merge_session_id: Option<String>,
    pub status: MergeStatus,
    #[serde(default)]
    pub merged_video_url: Option<String>,
    #[serde(default)]
    pub segment_metadata: Option<Vec<SegmentMetadata>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// 错误响应体
///
/// 字段都是可选的，服务器的错误体格式并不统一
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorBody {
    /// 合并后的诊断信息
    pub fn text(&self) -> String {
        match (&self.error, &self.message) {
            (Some(e), Some(m)) if e != m => format!("{} - {}", e, m),
            (Some(e), _) => e.clone(),
            (None, Some(m)) => m.clone(),
            (None, None) => String::new(),
        }
    }
}

/// 后端响应的统一解码结果
#[derive(Debug, Clone)]
pub enum ServerReply<T> {
    /// 2xx 且响应体符合预期结构
    Ok(T),
    /// 非 2xx，附带尽力解析的错误体
    Rejected { status: u16, body: ErrorBody, raw: String },
    /// 2xx 但响应体无法解码
    Malformed { status: u16, reason: String },
}
