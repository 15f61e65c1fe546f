// 上传会话
//
// 一个文件一次上传的完整生命周期：标识、分片计划、过期时间和状态。
// 只有分片确认和完成调用会修改会话，进入终止状态后不再允许任何修改。

use crate::api::types::{ChunkAck, InitiateResponse, SessionStatusResponse};
use crate::uploader::error::{UploadError, UploadErrorKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::Range;
use tracing::{debug, warn};

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// 已创建
    Initiated,
    /// 上传中
    #[serde(alias = "uploading")]
    InProgress,
    /// 已完成
    Completed,
    /// 已取消
    Cancelled,
    /// 已过期
    Expired,
}

impl SessionStatus {
    /// 是否为终止状态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::Expired
        )
    }
}

/// 根据文件大小和分片大小计算分片数
pub fn chunk_count(file_size: u64, chunk_size: u64) -> u32 {
    if file_size == 0 || chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size) as u32
}

/// 上传会话
#[derive(Debug, Clone)]
pub struct TransferSession {
    /// 服务器分配的会话 ID，断点续传时使用
    pub session_id: String,
    /// 分片提交地址模板
    pub upload_url: String,
    /// 分片大小，由服务器决定
    pub chunk_size: u64,
    /// 分片总数
    pub total_chunks: u32,
    /// 文件大小
    pub file_size: u64,
    /// 过期时间，过期后只能重新发起
    pub expires_at: DateTime<Utc>,
    uploaded: BTreeSet<u32>,
    remaining: BTreeSet<u32>,
    status: SessionStatus,
}

impl TransferSession {
    fn build(
        session_id: String,
        upload_url: String,
        chunk_size: u64,
        total_chunks: u32,
        file_size: u64,
        expires_at: DateTime<Utc>,
        uploaded: &[u32],
        status: SessionStatus,
    ) -> Result<Self, UploadError> {
        let expected = chunk_count(file_size, chunk_size);
        if file_size > 0 && chunk_size == 0 {
            return Err(UploadError::protocol(format!(
                "会话 {} 的分片大小为 0",
                session_id
            )));
        }
        if total_chunks != expected {
            return Err(UploadError::protocol(format!(
                "分片数不一致: 服务器={}, 按文件大小计算={}",
                total_chunks, expected
            )));
        }

        let uploaded: BTreeSet<u32> = uploaded
            .iter()
            .copied()
            .filter(|i| *i < total_chunks)
            .collect();
        let remaining = (0..total_chunks).filter(|i| !uploaded.contains(i)).collect();

        Ok(Self {
            session_id,
            upload_url,
            chunk_size,
            total_chunks,
            file_size,
            expires_at,
            uploaded,
            remaining,
            status,
        })
    }

    /// 由发起响应创建会话
    pub fn from_initiate(resp: InitiateResponse, file_size: u64) -> Result<Self, UploadError> {
        Self::build(
            resp.session_id,
            resp.upload_url,
            resp.chunk_size,
            resp.total_chunks,
            file_size,
            resp.expires_at,
            &resp.uploaded_chunks,
            SessionStatus::Initiated,
        )
    }

    /// 由状态查询响应恢复会话（断点续传）
    ///
    /// 服务器记录的已上传分片视为权威，不重新校验
    pub fn from_status(resp: SessionStatusResponse, file_size: u64) -> Result<Self, UploadError> {
        match resp.status {
            SessionStatus::Expired => {
                return Err(UploadError::new(
                    UploadErrorKind::SessionExpired,
                    format!("会话 {} 已过期，需要重新发起", resp.session_id),
                ))
            }
            SessionStatus::Cancelled => {
                return Err(UploadError::new(
                    UploadErrorKind::Conflict,
                    format!("会话 {} 已取消，需要重新发起", resp.session_id),
                ))
            }
            SessionStatus::Completed => {
                return Err(UploadError::new(
                    UploadErrorKind::Conflict,
                    format!("会话 {} 已完成", resp.session_id),
                ))
            }
            SessionStatus::Initiated | SessionStatus::InProgress => {}
        }

        let (upload_url, chunk_size, total_chunks, expires_at) = match (
            resp.upload_url,
            resp.chunk_size,
            resp.total_chunks,
            resp.expires_at,
        ) {
            (Some(url), Some(size), Some(total), Some(expires)) => (url, size, total, expires),
            _ => {
                return Err(UploadError::protocol(format!(
                    "会话 {} 的状态响应缺少续传所需字段",
                    resp.session_id
                )))
            }
        };

        Self::build(
            resp.session_id,
            upload_url,
            chunk_size,
            total_chunks,
            file_size,
            expires_at,
            &resp.uploaded_chunks,
            resp.status,
        )
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn uploaded_chunks(&self) -> &BTreeSet<u32> {
        &self.uploaded
    }

    pub fn remaining_chunks(&self) -> &BTreeSet<u32> {
        &self.remaining
    }

    /// 下一个待上传分片（升序）
    pub fn next_remaining(&self) -> Option<u32> {
        self.remaining.iter().next().copied()
    }

    pub fn is_fully_uploaded(&self) -> bool {
        self.remaining.is_empty()
    }

    /// 会话在给定时间是否已过期
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// 分片字节范围
    pub fn chunk_range(&self, index: u32) -> Range<u64> {
        let start = index as u64 * self.chunk_size;
        let end = (start + self.chunk_size).min(self.file_size);
        start..end
    }

    /// 已确认字节数
    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded
            .iter()
            .map(|i| {
                let r = self.chunk_range(*i);
                r.end - r.start
            })
            .sum()
    }

    /// 按已确认分片数计算的进度百分比
    pub fn progress_percent(&self) -> f64 {
        if self.total_chunks == 0 {
            return if self.status == SessionStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        self.uploaded.len() as f64 / self.total_chunks as f64 * 100.0
    }

    /// 分片提交路径
    ///
    /// 模板中有 `{chunkIndex}` 占位符时替换，否则追加在末尾
    pub fn chunk_path(&self, index: u32) -> String {
        if self.upload_url.contains("{chunkIndex}") {
            self.upload_url
                .replace("{chunkIndex}", &index.to_string())
        } else {
            format!("{}/{}", self.upload_url.trim_end_matches('/'), index)
        }
    }

    fn ensure_mutable(&self) -> Result<(), UploadError> {
        if !self.is_terminal() {
            return Ok(());
        }
        let kind = match self.status {
            SessionStatus::Expired => UploadErrorKind::SessionExpired,
            SessionStatus::Cancelled => UploadErrorKind::Cancelled,
            _ => UploadErrorKind::ProtocolError,
        };
        Err(UploadError::new(
            kind,
            format!("会话 {} 已处于终止状态 {:?}", self.session_id, self.status),
        ))
    }

    /// 进入上传中状态
    pub fn mark_in_progress(&mut self) -> Result<(), UploadError> {
        self.ensure_mutable()?;
        self.status = SessionStatus::InProgress;
        Ok(())
    }

    /// 应用分片确认
    ///
    /// 服务器返回的 uploaded/remaining 构成合法划分时以服务器为准，
    /// 否则只记录本次确认的分片
    pub fn apply_ack(&mut self, ack: &ChunkAck) -> Result<(), UploadError> {
        self.ensure_mutable()?;

        if ack.session_id != self.session_id {
            return Err(UploadError::protocol(format!(
                "分片确认的会话 ID 不匹配: 期望 {}, 实际 {}",
                self.session_id, ack.session_id
            )));
        }
        if ack.chunk_index >= self.total_chunks {
            return Err(UploadError::protocol(format!(
                "分片确认的索引越界: {} >= {}",
                ack.chunk_index, self.total_chunks
            )));
        }

        let uploaded: BTreeSet<u32> = ack.uploaded_chunks.iter().copied().collect();
        let remaining: BTreeSet<u32> = ack.remaining_chunks.iter().copied().collect();

        if self.is_valid_partition(&uploaded, &remaining) && uploaded.contains(&ack.chunk_index) {
            self.uploaded = uploaded;
            self.remaining = remaining;
        } else {
            warn!(
                "会话 {} 的分片确认集合不完整，仅记录分片 #{}",
                self.session_id, ack.chunk_index
            );
            self.remaining.remove(&ack.chunk_index);
            self.uploaded.insert(ack.chunk_index);
        }

        if self.status == SessionStatus::Initiated {
            self.status = SessionStatus::InProgress;
        }

        debug!(
            "会话 {} 分片确认: #{} ({}/{})",
            self.session_id,
            ack.chunk_index,
            self.uploaded.len(),
            self.total_chunks
        );
        Ok(())
    }

    fn is_valid_partition(&self, uploaded: &BTreeSet<u32>, remaining: &BTreeSet<u32>) -> bool {
        uploaded.is_disjoint(remaining)
            && uploaded.len() + remaining.len() == self.total_chunks as usize
            && uploaded
                .iter()
                .chain(remaining.iter())
                .all(|i| *i < self.total_chunks)
    }

    /// 标记完成
    pub fn mark_completed(&mut self) -> Result<(), UploadError> {
        self.ensure_mutable()?;
        self.status = SessionStatus::Completed;
        Ok(())
    }

    /// 标记取消，已终止时不做修改；返回是否发生了状态变化
    pub fn mark_cancelled(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = SessionStatus::Cancelled;
        true
    }

    /// 标记过期，已终止时不做修改
    pub fn mark_expired(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = SessionStatus::Expired;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn initiate(total_chunks: u32, chunk_size: u64, uploaded: Vec<u32>) -> InitiateResponse {
        InitiateResponse {
            session_id: "s-1".to_string(),
            upload_url: "/api/uploads/s-1/chunks/{chunkIndex}".to_string(),
            chunk_size,
            total_chunks,
            expires_at: Utc::now() + Duration::hours(1),
            uploaded_chunks: uploaded,
        }
    }

    fn ack(index: u32, uploaded: Vec<u32>, remaining: Vec<u32>) -> ChunkAck {
        ChunkAck {
            session_id: "s-1".to_string(),
            chunk_index: index,
            status: Some(SessionStatus::InProgress),
            uploaded_chunks: uploaded,
            remaining_chunks: remaining,
            progress_percent: 0.0,
            file_url: None,
            file_size: None,
            completed_at: None,
        }
    }

    fn assert_partition(session: &TransferSession) {
        let all: BTreeSet<u32> = (0..session.total_chunks).collect();
        let union: BTreeSet<u32> = session
            .uploaded_chunks()
            .union(session.remaining_chunks())
            .copied()
            .collect();
        assert_eq!(union, all);
        assert!(session.uploaded_chunks().is_disjoint(session.remaining_chunks()));
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0, 1024), 0);
        assert_eq!(chunk_count(1024, 1024), 1);
        assert_eq!(chunk_count(1025, 1024), 2);
        assert_eq!(chunk_count(4096, 1024), 4);
    }

    #[test]
    fn test_from_initiate() {
        let session = TransferSession::from_initiate(initiate(4, 1024, vec![]), 4000).unwrap();
        assert_eq!(session.status(), SessionStatus::Initiated);
        assert_eq!(session.next_remaining(), Some(0));
        assert_eq!(session.chunk_range(3), 3072..4000);
        assert_partition(&session);
    }

    #[test]
    fn test_from_initiate_with_prior_progress() {
        let session = TransferSession::from_initiate(initiate(4, 1024, vec![0, 1]), 4096).unwrap();
        assert_eq!(session.next_remaining(), Some(2));
        assert_eq!(session.uploaded_bytes(), 2048);
        assert_eq!(session.progress_percent(), 50.0);
        assert_partition(&session);
    }

    #[test]
    fn test_total_chunks_mismatch_is_protocol_error() {
        let err = TransferSession::from_initiate(initiate(3, 1024, vec![]), 4096).unwrap_err();
        assert_eq!(err.kind, UploadErrorKind::ProtocolError);
    }

    #[test]
    fn test_zero_byte_file() {
        let session = TransferSession::from_initiate(initiate(0, 1024, vec![]), 0).unwrap();
        assert_eq!(session.total_chunks, 0);
        assert!(session.is_fully_uploaded());
        assert_eq!(session.progress_percent(), 0.0);
    }

    #[test]
    fn test_apply_ack_adopts_server_partition() {
        let mut session =
            TransferSession::from_initiate(initiate(4, 1024, vec![]), 4096).unwrap();
        session.apply_ack(&ack(0, vec![0, 1], vec![2, 3])).unwrap();
        assert_eq!(session.status(), SessionStatus::InProgress);
        assert_eq!(session.next_remaining(), Some(2));
        assert_partition(&session);
    }

    #[test]
    fn test_apply_ack_with_inconsistent_sets() {
        let mut session =
            TransferSession::from_initiate(initiate(4, 1024, vec![]), 4096).unwrap();
        session.apply_ack(&ack(0, vec![0], vec![0, 1])).unwrap();
        assert_eq!(session.uploaded_chunks().len(), 1);
        assert_eq!(session.next_remaining(), Some(1));
        assert_partition(&session);
    }

    #[test]
    fn test_apply_ack_wrong_session() {
        let mut session =
            TransferSession::from_initiate(initiate(4, 1024, vec![]), 4096).unwrap();
        let mut a = ack(0, vec![0], vec![1, 2, 3]);
        a.session_id = "other".to_string();
        let err = session.apply_ack(&a).unwrap_err();
        assert_eq!(err.kind, UploadErrorKind::ProtocolError);
    }

    #[test]
    fn test_terminal_session_rejects_mutation() {
        let mut session =
            TransferSession::from_initiate(initiate(4, 1024, vec![]), 4096).unwrap();
        assert!(session.mark_cancelled());
        assert!(!session.mark_cancelled());
        assert!(!session.mark_expired());
        assert_eq!(session.status(), SessionStatus::Cancelled);

        let err = session.apply_ack(&ack(0, vec![0], vec![1, 2, 3])).unwrap_err();
        assert_eq!(err.kind, UploadErrorKind::Cancelled);
        assert!(session.mark_completed().is_err());
        assert!(session.uploaded_chunks().is_empty());
    }

    #[test]
    fn test_chunk_path() {
        let session = TransferSession::from_initiate(initiate(4, 1024, vec![]), 4096).unwrap();
        assert_eq!(session.chunk_path(2), "/api/uploads/s-1/chunks/2");

        let mut plain = session.clone();
        plain.upload_url = "/api/uploads/s-1/chunks/".to_string();
        assert_eq!(plain.chunk_path(3), "/api/uploads/s-1/chunks/3");
    }

    #[test]
    fn test_from_status_expired() {
        let resp = SessionStatusResponse {
            session_id: "s-1".to_string(),
            status: SessionStatus::Expired,
            progress_percent: 50.0,
            uploaded_chunks: vec![0, 1],
            remaining_chunks: vec![2, 3],
            upload_url: None,
            chunk_size: None,
            total_chunks: None,
            expires_at: None,
        };
        let err = TransferSession::from_status(resp, 4096).unwrap_err();
        assert_eq!(err.kind, UploadErrorKind::SessionExpired);
    }

    #[test]
    fn test_expiry_check() {
        let session = TransferSession::from_initiate(initiate(4, 1024, vec![]), 4096).unwrap();
        assert!(!session.is_expired_at(Utc::now()));
        assert!(session.is_expired_at(Utc::now() + Duration::hours(2)));
    }
}
