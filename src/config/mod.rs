// 配置管理模块

use crate::merge::{
    MergeMode, PollPolicy, DEFAULT_MAX_POLL_ATTEMPTS, DEFAULT_MAX_POLL_INTERVAL_MS,
    DEFAULT_POLL_BACKOFF_MULTIPLIER, DEFAULT_POLL_INTERVAL_MS,
};
use crate::uploader::{
    RetryPolicy, UploadOptions, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_MAX_RETRIES,
    DEFAULT_RETRY_DELAY_MS,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 后端接口配置
    #[serde(default)]
    pub api: ApiConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 合并配置
    #[serde(default)]
    pub merge: MergeConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

// =====================================================
// 后端接口
// =====================================================

/// 后端接口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// 后端地址（不含 /api 前缀）
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// 单次请求超时（秒，默认 30）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// 连通性预检地址
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_user_agent() -> String {
    format!("statement-upload/{}", env!("CARGO_PKG_VERSION"))
}

fn default_health_path() -> String {
    "/api/health".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            user_agent: default_user_agent(),
            health_path: default_health_path(),
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// =====================================================
// 上传
// =====================================================

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 建议分片大小 (MB)，服务器可覆盖；0 表示由服务器决定
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,
    /// 单步最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 首次重试延迟（毫秒）
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// 重试退避倍数，必须大于 1
    #[serde(default = "default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: f64,
    /// 单个文件大小上限 (MB)，0 表示不检查
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    /// 取消后通知服务器的超时（秒）
    #[serde(default = "default_cancel_timeout_secs")]
    pub cancel_timeout_secs: u64,
}

fn default_chunk_size_mb() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

fn default_retry_backoff_multiplier() -> f64 {
    DEFAULT_BACKOFF_MULTIPLIER
}

fn default_max_file_size_mb() -> u64 {
    500
}

fn default_cancel_timeout_secs() -> u64 {
    5
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size_mb: default_chunk_size_mb(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_backoff_multiplier: default_retry_backoff_multiplier(),
            max_file_size_mb: default_max_file_size_mb(),
            cancel_timeout_secs: default_cancel_timeout_secs(),
        }
    }
}

impl UploadConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            self.retry_delay_ms,
            self.retry_backoff_multiplier,
        )
    }

    /// 由配置生成默认上传选项（观察者和取消令牌由调用方替换）
    pub fn to_options(&self) -> UploadOptions {
        let mut options = UploadOptions::default().with_retry(self.retry_policy());
        if self.chunk_size_mb > 0 {
            options = options.with_chunk_size(self.chunk_size_mb * 1024 * 1024);
        }
        if self.max_file_size_mb > 0 {
            options = options.with_max_file_size(self.max_file_size_mb * 1024 * 1024);
        }
        options.cancel_timeout = Duration::from_secs(self.cancel_timeout_secs);
        options
    }
}

// =====================================================
// 合并
// =====================================================

/// 合并配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// 提交方式: sessions | combined
    #[serde(default)]
    pub mode: MergeMode,
    /// 首次轮询间隔（毫秒）
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_backoff_multiplier")]
    pub poll_backoff_multiplier: f64,
    /// 轮询间隔上限（毫秒）
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,
    /// 最多轮询次数，超过后以超时失败
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_poll_backoff_multiplier() -> f64 {
    DEFAULT_POLL_BACKOFF_MULTIPLIER
}

fn default_max_poll_interval_ms() -> u64 {
    DEFAULT_MAX_POLL_INTERVAL_MS
}

fn default_max_poll_attempts() -> u32 {
    DEFAULT_MAX_POLL_ATTEMPTS
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            mode: MergeMode::default(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_backoff_multiplier: default_poll_backoff_multiplier(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            max_poll_attempts: default_max_poll_attempts(),
        }
    }
}

impl MergeConfig {
    pub fn to_poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval_ms: self.poll_interval_ms,
            multiplier: self.poll_backoff_multiplier,
            max_interval_ms: self.max_poll_interval_ms,
            max_attempts: self.max_poll_attempts,
        }
    }
}

// =====================================================
// 日志
// =====================================================

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

impl AppConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.api.base_url.trim().is_empty() {
            anyhow::bail!("api.base_url 不能为空");
        }
        if self.api.request_timeout_secs == 0 {
            anyhow::bail!("api.request_timeout_secs 必须大于 0");
        }
        if !(self.upload.retry_backoff_multiplier > 1.0) {
            anyhow::bail!(
                "upload.retry_backoff_multiplier 必须大于 1，当前: {}",
                self.upload.retry_backoff_multiplier
            );
        }
        if self.merge.poll_backoff_multiplier < 1.0 {
            anyhow::bail!(
                "merge.poll_backoff_multiplier 不能小于 1，当前: {}",
                self.merge.poll_backoff_multiplier
            );
        }
        if self.merge.max_poll_attempts == 0 {
            anyhow::bail!("merge.max_poll_attempts 必须大于 0");
        }
        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);

        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 配置文件不存在时写出一份默认配置，已存在但解析失败时保留原文件
                if !std::path::Path::new(path).exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.api.request_timeout_secs, 30);
        assert_eq!(config.upload.max_retries, 3);
        assert_eq!(config.upload.retry_delay_ms, 1000);
        assert_eq!(config.upload.retry_backoff_multiplier, 2.0);
        assert_eq!(config.merge.mode, MergeMode::Sessions);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut config = AppConfig::default();
        config.api.base_url = "https://api.example.com".to_string();
        config.merge.mode = MergeMode::Combined;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.api.base_url, "https://api.example.com");
        assert_eq!(loaded.merge.mode, MergeMode::Combined);
        assert_eq!(loaded.upload.max_retries, config.upload.max_retries);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [api]
            base_url = "https://api.example.com"

            [upload]
            max_retries = 5

            [merge]
            mode = "combined"
            "#,
        )
        .unwrap();

        assert_eq!(config.api.request_timeout_secs, 30);
        assert_eq!(config.upload.max_retries, 5);
        assert_eq!(config.upload.retry_delay_ms, 1000);
        assert_eq!(config.merge.mode, MergeMode::Combined);
        assert_eq!(config.merge.max_poll_attempts, DEFAULT_MAX_POLL_ATTEMPTS);
        assert!(config.log.enabled);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.upload.retry_backoff_multiplier = 1.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.api.base_url = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[upload]\nretry_backoff_multiplier = 0.5\n").unwrap();

        let result = AppConfig::load_from_file(path.to_str().unwrap()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_load_or_default_writes_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let path_str = path.to_str().unwrap();

        let config = AppConfig::load_or_default(path_str).await;
        assert_eq!(config.upload.max_retries, 3);
        assert!(path.exists());
    }

    #[test]
    fn test_upload_config_to_options() {
        let upload = UploadConfig {
            chunk_size_mb: 8,
            max_retries: 2,
            max_file_size_mb: 0,
            cancel_timeout_secs: 3,
            ..UploadConfig::default()
        };
        let options = upload.to_options();
        assert_eq!(options.chunk_size, Some(8 * 1024 * 1024));
        assert_eq!(options.retry.max_retries, 2);
        assert_eq!(options.max_file_size, None);
        assert_eq!(options.cancel_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_merge_config_to_poll_policy() {
        let merge = MergeConfig {
            poll_interval_ms: 500,
            max_poll_attempts: 4,
            ..MergeConfig::default()
        };
        let policy = merge.to_poll_policy();
        assert_eq!(policy.interval_ms, 500);
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.delay(1), Duration::from_millis(500));
    }
}
