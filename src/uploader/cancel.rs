// 取消控制器
//
// 每个逻辑上传操作（单个文件，或一组三段合并上传）持有一个，
// 贯穿会话建立、分片发送、重试等待和合并轮询。

use crate::uploader::error::UploadError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// 协作式取消令牌
#[derive(Debug, Clone, Default)]
pub struct CancellationController {
    token: CancellationToken,
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取消，可重复调用
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            info!("收到取消请求");
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 派生子控制器：父级取消会传递给子级，子级取消不影响父级
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    /// 底层令牌
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// 已取消时返回 CANCELLED 错误
    pub fn check(&self) -> Result<(), UploadError> {
        if self.is_cancelled() {
            Err(UploadError::cancelled())
        } else {
            Ok(())
        }
    }

    /// 可被取消的等待（重试退避、轮询间隔）
    ///
    /// 取消时定时器随 future 一起被丢弃
    pub async fn sleep(&self, duration: Duration) -> Result<(), UploadError> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(UploadError::cancelled()),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// 运行 future，取消时立即丢弃它并返回 CANCELLED
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, UploadError> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(UploadError::cancelled()),
            output = fut => Ok(output),
        }
    }
}

impl From<CancellationToken> for CancellationController {
    fn from(token: CancellationToken) -> Self {
        Self { token }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::error::UploadErrorKind;

    #[test]
    fn test_cancel_is_idempotent() {
        let controller = CancellationController::new();
        assert!(controller.check().is_ok());
        controller.cancel();
        controller.cancel();
        assert!(controller.is_cancelled());
        assert_eq!(controller.check().unwrap_err().kind, UploadErrorKind::Cancelled);
    }

    #[test]
    fn test_child_follows_parent_only() {
        let parent = CancellationController::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());

        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted_by_cancel() {
        let controller = CancellationController::new();
        let canceller = controller.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let started = tokio::time::Instant::now();
        let result = controller.sleep(Duration::from_secs(3600)).await;
        assert!(result.unwrap_err().is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_run_completes_when_not_cancelled() {
        let controller = CancellationController::new();
        let value = controller.run(async { 42 }).await.unwrap();
        assert_eq!(value, 42);
    }
}
