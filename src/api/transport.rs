// 传输能力接口
//
// HTTP 客户端和令牌读取不再是全局单例，而是在构造时注入，
// 测试可以直接替换为内存实现。

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::fmt;

/// HTTP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// multipart 请求中的一个文件部分
#[derive(Debug, Clone)]
pub struct FilePart {
    /// 表单字段名
    pub field: String,
    /// 文件名
    pub file_name: String,
    /// MIME 类型
    pub mime_type: String,
    /// 文件内容，重试时共享同一份缓冲
    pub data: Bytes,
}

/// 请求体
#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    /// 原始字节（分片上传）
    Bytes(Vec<u8>),
    /// multipart 表单：普通文本字段 + 文件部分
    Multipart {
        fields: Vec<(String, String)>,
        parts: Vec<FilePart>,
    },
}

/// 发往后端的请求（路径相对于配置的 base_url）
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn json(mut self, value: Value) -> Self {
        self.body = RequestBody::Json(value);
        self
    }

    pub fn bytes(mut self, data: Vec<u8>) -> Self {
        self.body = RequestBody::Bytes(data);
        self
    }

    pub fn multipart(mut self, fields: Vec<(String, String)>, parts: Vec<FilePart>) -> Self {
        self.body = RequestBody::Multipart { fields, parts };
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// 请求体字节数（用于日志）
    pub fn body_len(&self) -> usize {
        match &self.body {
            RequestBody::Empty => 0,
            RequestBody::Json(v) => v.to_string().len(),
            RequestBody::Bytes(b) => b.len(),
            RequestBody::Multipart { parts, .. } => parts.iter().map(|p| p.data.len()).sum(),
        }
    }
}

/// 后端原始响应
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// 传输层错误（尚未分类）
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// 无法建立连接（拒绝、DNS 等）
    #[error("连接失败: {0}")]
    Connect(String),
    /// 传输层超时
    #[error("请求超时: {0}")]
    Timeout(String),
    /// 其它请求错误（请求构造、读取响应体等）
    #[error("请求失败: {0}")]
    Request(String),
}

/// 后端传输能力
///
/// 核心逻辑只通过这个接口访问网络和认证信息
#[async_trait]
pub trait Transport: Send + Sync {
    /// 当前访问令牌；认证由外部协作者负责，这里只读
    fn current_token(&self) -> Option<String>;

    /// 发送一个请求
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError>;

    /// 连通性预检，所有会话共享
    async fn check_connectivity(&self) -> bool {
        true
    }
}
