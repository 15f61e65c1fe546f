// 测试用内存传输实现
//
// 按路径排队预设响应，并记录每一个收到的请求。

use crate::api::transport::{ApiRequest, ApiResponse, Transport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

#[derive(Debug, Clone)]
struct MockReply {
    result: Result<ApiResponse, TransportError>,
    /// 重复使用，不出队
    repeat: bool,
}

/// 脚本化的传输替身
pub struct MockTransport {
    routes: Mutex<HashMap<String, VecDeque<MockReply>>>,
    requests: Mutex<Vec<ApiRequest>>,
    token: Option<String>,
    delay: Option<Duration>,
    connectivity_delay: Option<Duration>,
    online: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            token: Some("test-token".to_string()),
            delay: None,
            connectivity_delay: None,
            online: true,
        }
    }

    pub fn without_token(mut self) -> Self {
        self.token = None;
        self
    }

    /// 每个请求先等待一段时间再返回
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 连通性预检先等待一段时间再返回
    pub fn with_connectivity_delay(mut self, delay: Duration) -> Self {
        self.connectivity_delay = Some(delay);
        self
    }

    pub fn offline(mut self) -> Self {
        self.online = false;
        self
    }

    fn push(&self, path: &str, reply: MockReply) {
        self.routes
            .lock()
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn push_json(&self, path: &str, status: u16, body: Value) {
        self.push_raw(path, status, &body.to_string());
    }

    pub fn push_raw(&self, path: &str, status: u16, body: &str) {
        self.push(
            path,
            MockReply {
                result: Ok(ApiResponse::new(status, body)),
                repeat: false,
            },
        );
    }

    /// 该路径之后的请求都返回同一个响应
    pub fn repeat_json(&self, path: &str, status: u16, body: Value) {
        self.push(
            path,
            MockReply {
                result: Ok(ApiResponse::new(status, body.to_string())),
                repeat: true,
            },
        );
    }

    pub fn push_transport_error(&self, path: &str, error: TransportError) {
        self.push(
            path,
            MockReply {
                result: Err(error),
                repeat: false,
            },
        );
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// 某个路径收到的请求数
    pub fn count_for(&self, path: &str) -> usize {
        self.requests.lock().iter().filter(|r| r.path == path).count()
    }

    /// 路径以给定前缀开头的请求数
    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.path.starts_with(prefix))
            .count()
    }

    pub fn paths(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.path.clone()).collect()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn current_token(&self) -> Option<String> {
        self.token.clone()
    }

    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let path = request.path.clone();
        self.requests.lock().push(request);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let reply = {
            let mut routes = self.routes.lock();
            match routes.get_mut(&path) {
                Some(queue) => match queue.front() {
                    Some(front) if front.repeat => Some(front.clone()),
                    Some(_) => queue.pop_front(),
                    None => None,
                },
                None => None,
            }
        };

        match reply {
            Some(reply) => reply.result,
            None => Ok(ApiResponse::new(
                404,
                json!({ "error": format!("no mock route for {}", path) }).to_string(),
            )),
        }
    }

    async fn check_connectivity(&self) -> bool {
        if let Some(delay) = self.connectivity_delay {
            tokio::time::sleep(delay).await;
        }
        self.online
    }
}

// =====================================================
// 响应构造辅助函数
// =====================================================

pub const TEST_SESSION: &str = "s-1";

pub fn chunk_path(session_id: &str, index: u32) -> String {
    format!("/api/uploads/{}/chunks/{}", session_id, index)
}

pub fn initiate_body(session_id: &str, chunk_size: u64, total_chunks: u32, uploaded: &[u32]) -> Value {
    json!({
        "sessionId": session_id,
        "uploadUrl": format!("/api/uploads/{}/chunks/{{chunkIndex}}", session_id),
        "chunkSize": chunk_size,
        "totalChunks": total_chunks,
        "expiresAt": "2099-01-01T00:00:00Z",
        "uploadedChunks": uploaded,
    })
}

/// 分片确认：already 与 index 视为已上传
pub fn ack_body(session_id: &str, index: u32, total: u32, already: &[u32]) -> Value {
    let uploaded: Vec<u32> = (0..total)
        .filter(|i| *i == index || already.contains(i))
        .collect();
    let remaining: Vec<u32> = (0..total).filter(|i| !uploaded.contains(i)).collect();
    json!({
        "sessionId": session_id,
        "chunkIndex": index,
        "status": "in_progress",
        "uploadedChunks": uploaded,
        "remainingChunks": remaining,
        "progressPercent": uploaded.len() as f64 / total as f64 * 100.0,
    })
}

/// 顺序上传时的分片确认：0..=index 已上传
pub fn sequential_ack(session_id: &str, index: u32, total: u32) -> Value {
    let already: Vec<u32> = (0..index).collect();
    ack_body(session_id, index, total, &already)
}

pub fn finalize_body(session_id: &str, file_size: u64) -> Value {
    json!({
        "sessionId": session_id,
        "status": "completed",
        "fileUrl": format!("https://cdn.example.com/{}.mp4", session_id),
        "fileSize": file_size,
        "completedAt": "2026-10-19T12:00:00Z",
    })
}
