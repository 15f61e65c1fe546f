// 基于 reqwest 的传输实现
//
// 令牌由外部认证协作者写入 TokenStore，这里只读取；
// 单次请求超时由 UploadApi 负责，客户端本身只设置连接超时。

use crate::api::transport::{ApiRequest, ApiResponse, Method, RequestBody, Transport, TransportError};
use crate::config::ApiConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::multipart;
use reqwest::{Client, RequestBuilder};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 连通性预检超时: 5 秒
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(5);

/// 访问令牌存储
///
/// 认证协作者负责写入和刷新，上传核心只读
#[derive(Debug, Default)]
pub struct TokenStore {
    token: RwLock<Option<String>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        let store = Self::new();
        store.set(token);
        store
    }

    pub fn set(&self, token: impl Into<String>) {
        let token = token.into();
        if token.trim().is_empty() {
            self.clear();
            return;
        }
        *self.token.write() = Some(token);
    }

    pub fn clear(&self) {
        *self.token.write() = None;
    }

    pub fn get(&self) -> Option<String> {
        self.token.read().clone()
    }
}

/// HTTP 传输
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    health_path: String,
    tokens: Arc<TokenStore>,
}

impl HttpTransport {
    /// 创建 HTTP 传输
    ///
    /// # 参数
    /// * `config` - 后端地址和超时配置
    /// * `tokens` - 令牌存储（与认证协作者共享）
    pub fn new(config: &ApiConfig, tokens: Arc<TokenStore>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .context("Failed to create HTTP client")?;

        info!("初始化上传客户端: base_url={}", config.base_url);

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            health_path: config.health_path.clone(),
            tokens,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// 拼接完整地址；已是绝对地址时原样返回
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// 构建 reqwest 请求
    fn build(&self, request: ApiRequest) -> Result<RequestBuilder, TransportError> {
        let url = self.url(&request.path);
        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Delete => self.client.delete(&url),
        };

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Bytes(data) => builder.body(data),
            RequestBody::Multipart { fields, parts } => {
                let mut form = multipart::Form::new();
                for (name, value) in fields {
                    form = form.text(name, value);
                }
                for part in parts {
                    let len = part.data.len() as u64;
                    let file_part = multipart::Part::stream_with_length(reqwest::Body::from(part.data), len)
                        .file_name(part.file_name)
                        .mime_str(&part.mime_type)
                        .map_err(|e| TransportError::Request(format!("无效的 MIME 类型: {}", e)))?;
                    form = form.part(part.field, file_part);
                }
                builder.multipart(form)
            }
        };

        Ok(builder)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn current_token(&self) -> Option<String> {
        self.tokens.get()
    }

    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let builder = self.build(request)?;
        let response = builder.send().await.map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(map_reqwest_error)?;
        debug!("响应: status={}, {} bytes", status, body.len());

        Ok(ApiResponse::new(status, body))
    }

    /// 能收到任何 HTTP 响应即视为连通
    async fn check_connectivity(&self) -> bool {
        let url = self.url(&self.health_path);
        match self
            .client
            .get(&url)
            .timeout(CONNECTIVITY_TIMEOUT)
            .send()
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!("连通性预检失败: {}: {}", url, e);
                false
            }
        }
    }
}

/// reqwest 错误映射为传输错误
fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Request(e.to_string())
    }
}
