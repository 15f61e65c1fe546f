// 文件哈希计算
//
// 整文件 SHA-256 用于服务端去重/续传识别，分片 SHA-256 随每个分片发送，
// 服务端据此判断传输内容是否损坏（HASH_MISMATCH）。

use crate::uploader::cancel::CancellationController;
use crate::uploader::error::{UploadError, UploadErrorKind};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// 读取缓冲区大小: 64KB
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// 哈希计算器
pub struct HashComputer;

impl HashComputer {
    /// 计算字节数组的哈希（十六进制）
    ///
    /// 空输入同样返回确定的摘要
    pub fn digest_bytes(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    /// 计算文件哈希
    ///
    /// 在阻塞线程池中执行文件 I/O；每读一个缓冲区检查一次取消，
    /// 取消后阻塞任务尽快退出，不会继续读完整个文件
    pub async fn digest_file(
        path: &Path,
        cancel: &CancellationController,
    ) -> Result<String, UploadError> {
        let path = path.to_path_buf();
        let cancel = cancel.clone();

        tokio::task::spawn_blocking(move || Self::digest_file_sync(&path, &cancel))
            .await
            .map_err(|e| {
                UploadError::new(UploadErrorKind::UnknownError, format!("哈希计算任务执行失败: {}", e))
            })?
    }

    /// 同步计算文件哈希（内部方法）
    fn digest_file_sync(
        path: &Path,
        cancel: &CancellationController,
    ) -> Result<String, UploadError> {
        let file = std::fs::File::open(path).map_err(|e| {
            UploadError::validation(format!("无法打开文件: {:?}, 错误: {}", path, e))
        })?;

        let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        let mut total = 0u64;

        loop {
            cancel.check()?;
            let n = reader.read(&mut buffer).map_err(|e| {
                UploadError::new(UploadErrorKind::UnknownError, format!("读取文件失败: {}", e))
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            total += n as u64;
        }

        let digest = hex::encode(hasher.finalize());
        debug!("文件哈希计算完成: path={:?}, size={}, sha256={}", path, total, digest);
        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_digest_bytes_deterministic() {
        let a = HashComputer::digest_bytes(b"statement video");
        let b = HashComputer::digest_bytes(b"statement video");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, HashComputer::digest_bytes(b"other video"));
    }

    #[test]
    fn test_digest_empty_input() {
        assert_eq!(
            HashComputer::digest_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_digest_file_matches_bytes() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let content = vec![7u8; 200 * 1024];
        temp_file.write_all(&content).unwrap();
        temp_file.flush().unwrap();

        let cancel = CancellationController::new();
        let file_digest = HashComputer::digest_file(temp_file.path(), &cancel)
            .await
            .unwrap();
        assert_eq!(file_digest, HashComputer::digest_bytes(&content));
    }

    #[tokio::test]
    async fn test_digest_missing_file() {
        let err = HashComputer::digest_file(
            Path::new("/definitely/not/here.mp4"),
            &CancellationController::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, UploadErrorKind::ValidationError);
    }

    #[test]
    fn test_digest_stops_when_cancelled() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(&vec![1u8; 4 * READ_BUFFER_SIZE]).unwrap();
        temp_file.flush().unwrap();

        let cancel = CancellationController::new();
        cancel.cancel();

        let err = HashComputer::digest_file_sync(temp_file.path(), &cancel).unwrap_err();
        assert_eq!(err.kind, UploadErrorKind::Cancelled);
    }
}
