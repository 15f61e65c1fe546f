// 上传错误分类
//
// 分类只在收到原始 HTTP/传输结果的边界处发生一次，
// 上层（编排器、重试策略、合并协调器）只处理类型化的 UploadError。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 上传错误类型
///
/// 是否可重试只由类型决定，与具体实例无关
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadErrorKind {
    /// 网络错误（可重试）：连接拒绝、DNS、请求发送失败
    NetworkError,
    /// 单次请求超时（可重试）
    TimeoutError,
    /// 服务器错误 5xx（可重试）
    ServerError,
    /// 限流 429（可重试）
    QuotaExceeded,
    /// 文件过大 413 或本地预检失败（不可重试）
    FileTooLarge,
    /// 认证失败 401/403 或没有可用令牌（不可重试，由上层刷新后重来）
    AuthenticationError,
    /// 完整性校验失败（不可重试，需要重新建立会话）
    HashMismatch,
    /// 会话过期 410 或本地 expiresAt 已过（不可重试，需要重新发起）
    SessionExpired,
    /// 请求参数错误 422（不可重试）
    ValidationError,
    /// 冲突 409（不可重试）
    Conflict,
    /// 响应可解析但违反协议约定（不可重试）
    ProtocolError,
    /// 主动取消（不可重试）
    Cancelled,
    /// 未分类错误，包括无法解析的错误体（默认不可重试）
    UnknownError,
}

impl UploadErrorKind {
    /// 是否可重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UploadErrorKind::NetworkError
                | UploadErrorKind::TimeoutError
                | UploadErrorKind::ServerError
                | UploadErrorKind::QuotaExceeded
        )
    }

    /// 协议中的错误码字符串
    pub fn as_code(&self) -> &'static str {
        match self {
            UploadErrorKind::NetworkError => "NETWORK_ERROR",
            UploadErrorKind::TimeoutError => "TIMEOUT_ERROR",
            UploadErrorKind::ServerError => "SERVER_ERROR",
            UploadErrorKind::QuotaExceeded => "QUOTA_EXCEEDED",
            UploadErrorKind::FileTooLarge => "FILE_TOO_LARGE",
            UploadErrorKind::AuthenticationError => "AUTHENTICATION_ERROR",
            UploadErrorKind::HashMismatch => "HASH_MISMATCH",
            UploadErrorKind::SessionExpired => "SESSION_EXPIRED",
            UploadErrorKind::ValidationError => "VALIDATION_ERROR",
            UploadErrorKind::Conflict => "CONFLICT",
            UploadErrorKind::ProtocolError => "PROTOCOL_ERROR",
            UploadErrorKind::Cancelled => "CANCELLED",
            UploadErrorKind::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// 从服务器返回的结构化错误码转换
    ///
    /// 无法识别的错误码返回 None，由调用方回退到 HTTP 状态码分类
    pub fn from_code(code: &str) -> Option<Self> {
        let kind = match code.trim().to_ascii_uppercase().as_str() {
            "NETWORK_ERROR" => UploadErrorKind::NetworkError,
            "TIMEOUT_ERROR" => UploadErrorKind::TimeoutError,
            "SERVER_ERROR" => UploadErrorKind::ServerError,
            "QUOTA_EXCEEDED" | "RATE_LIMITED" => UploadErrorKind::QuotaExceeded,
            "FILE_TOO_LARGE" => UploadErrorKind::FileTooLarge,
            "AUTHENTICATION_ERROR" | "UNAUTHORIZED" => UploadErrorKind::AuthenticationError,
            "HASH_MISMATCH" => UploadErrorKind::HashMismatch,
            "SESSION_EXPIRED" => UploadErrorKind::SessionExpired,
            "VALIDATION_ERROR" => UploadErrorKind::ValidationError,
            "CONFLICT" | "DUPLICATE" => UploadErrorKind::Conflict,
            _ => return None,
        };
        Some(kind)
    }

    /// 从 HTTP 状态码转换
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => UploadErrorKind::AuthenticationError,
            408 => UploadErrorKind::TimeoutError,
            409 => UploadErrorKind::Conflict,
            410 => UploadErrorKind::SessionExpired,
            413 => UploadErrorKind::FileTooLarge,
            400 | 422 => UploadErrorKind::ValidationError,
            429 => UploadErrorKind::QuotaExceeded,
            500..=599 => UploadErrorKind::ServerError,
            _ => UploadErrorKind::UnknownError,
        }
    }
}

impl fmt::Display for UploadErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_code())
    }
}

/// 上传错误
///
/// `message` 只用于诊断，不参与控制流
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct UploadError {
    /// 错误类型
    pub kind: UploadErrorKind,
    /// 产生该错误的 HTTP 状态码
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// 诊断信息
    pub message: String,
}

impl UploadError {
    pub fn new(kind: UploadErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code: None,
            message: message.into(),
        }
    }

    pub fn with_status(kind: UploadErrorKind, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code: Some(status_code),
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(UploadErrorKind::Cancelled, "上传已取消")
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(UploadErrorKind::ValidationError, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(UploadErrorKind::ProtocolError, message)
    }

    pub fn unauthenticated() -> Self {
        Self::new(UploadErrorKind::AuthenticationError, "没有可用的访问令牌")
    }

    /// 是否可重试（由 kind 决定）
    pub fn retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == UploadErrorKind::Cancelled
    }
}

/// 兼容旧服务端：错误体里没有结构化错误码时，按消息内容识别哈希校验失败
///
/// 仅作为回退手段，优先使用 `code` 字段
pub fn looks_like_hash_mismatch(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("hash mismatch")
        || lower.contains("hash_mismatch")
        || lower.contains("checksum")
        || lower.contains("integrity")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_is_fixed_per_kind() {
        assert!(UploadErrorKind::NetworkError.is_retryable());
        assert!(UploadErrorKind::TimeoutError.is_retryable());
        assert!(UploadErrorKind::ServerError.is_retryable());
        assert!(UploadErrorKind::QuotaExceeded.is_retryable());

        assert!(!UploadErrorKind::FileTooLarge.is_retryable());
        assert!(!UploadErrorKind::AuthenticationError.is_retryable());
        assert!(!UploadErrorKind::HashMismatch.is_retryable());
        assert!(!UploadErrorKind::SessionExpired.is_retryable());
        assert!(!UploadErrorKind::ValidationError.is_retryable());
        assert!(!UploadErrorKind::Conflict.is_retryable());
        assert!(!UploadErrorKind::ProtocolError.is_retryable());
        assert!(!UploadErrorKind::Cancelled.is_retryable());
        assert!(!UploadErrorKind::UnknownError.is_retryable());
    }

    #[test]
    fn test_from_status() {
        assert_eq!(UploadErrorKind::from_status(401), UploadErrorKind::AuthenticationError);
        assert_eq!(UploadErrorKind::from_status(403), UploadErrorKind::AuthenticationError);
        assert_eq!(UploadErrorKind::from_status(410), UploadErrorKind::SessionExpired);
        assert_eq!(UploadErrorKind::from_status(413), UploadErrorKind::FileTooLarge);
        assert_eq!(UploadErrorKind::from_status(422), UploadErrorKind::ValidationError);
        assert_eq!(UploadErrorKind::from_status(429), UploadErrorKind::QuotaExceeded);
        assert_eq!(UploadErrorKind::from_status(500), UploadErrorKind::ServerError);
        assert_eq!(UploadErrorKind::from_status(503), UploadErrorKind::ServerError);
        assert_eq!(UploadErrorKind::from_status(418), UploadErrorKind::UnknownError);
    }

    #[test]
    fn test_from_code() {
        assert_eq!(
            UploadErrorKind::from_code("HASH_MISMATCH"),
            Some(UploadErrorKind::HashMismatch)
        );
        assert_eq!(
            UploadErrorKind::from_code("session_expired"),
            Some(UploadErrorKind::SessionExpired)
        );
        assert_eq!(UploadErrorKind::from_code("SOMETHING_ELSE"), None);
    }

    #[test]
    fn test_display_contains_code() {
        let err = UploadError::with_status(UploadErrorKind::ServerError, 500, "boom");
        assert_eq!(err.to_string(), "SERVER_ERROR: boom");
        assert!(err.retryable());
    }

    #[test]
    fn test_hash_mismatch_shim() {
        assert!(looks_like_hash_mismatch("Chunk hash mismatch detected"));
        assert!(looks_like_hash_mismatch("Checksum failed"));
        assert!(!looks_like_hash_mismatch("bad request"));
    }
}
