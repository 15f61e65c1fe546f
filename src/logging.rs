//! 日志系统配置
//!
//! 控制台输出 + 按大小滚动的日志文件，启动时清理过期日志

use crate::config::LogConfig;
use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "statement-upload.";
const LOG_FILE_SUFFIX: &str = ".log";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 按大小滚动的日志文件（内部状态）
struct RollingFileInner {
    /// 启动时间戳（YYYY-MM-DD-HHMMSS），同一进程的所有文件共用
    start_timestamp: String,
    log_dir: PathBuf,
    current_file: Option<File>,
    /// 0 为基础文件，之后依次为 _1、_2 ...
    current_index: u32,
    max_file_size: u64,
    current_size: u64,
}

impl RollingFileInner {
    fn open(log_dir: PathBuf, max_file_size: u64, start_timestamp: String) -> io::Result<Self> {
        let mut inner = Self {
            start_timestamp,
            log_dir,
            current_file: None,
            current_index: 0,
            max_file_size,
            current_size: 0,
        };
        inner.open_current()?;
        Ok(inner)
    }

    fn open_current(&mut self) -> io::Result<()> {
        let path = log_file_path(&self.log_dir, &self.start_timestamp, self.current_index);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.current_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.current_file = Some(file);
        Ok(())
    }

    /// 空文件不滚动，避免单条超大日志无限产生新文件
    fn should_rotate(&self, incoming: usize) -> bool {
        self.current_size > 0 && self.current_size + incoming as u64 > self.max_file_size
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.current_file.take() {
            file.flush()?;
        }
        self.current_index += 1;
        self.open_current()
    }

    fn write_data(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.should_rotate(buf.len()) {
            self.rotate()?;
        }

        match &mut self.current_file {
            Some(file) => {
                let written = file.write(buf)?;
                self.current_size += written as u64;
                Ok(written)
            }
            None => Err(io::Error::new(io::ErrorKind::Other, "日志文件未打开")),
        }
    }

    fn flush_file(&mut self) -> io::Result<()> {
        if let Some(file) = &mut self.current_file {
            file.flush()?;
        }
        Ok(())
    }
}

/// 按大小滚动的日志文件
///
/// 文件名: statement-upload.YYYY-MM-DD-HHMMSS[_N].log
#[derive(Clone)]
pub struct RollingFileWriter {
    inner: Arc<Mutex<RollingFileInner>>,
}

impl RollingFileWriter {
    pub fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let start_timestamp = Local::now().format("%Y-%m-%d-%H%M%S").to_string();
        Self::with_timestamp(log_dir, max_file_size, start_timestamp)
    }

    fn with_timestamp(
        log_dir: PathBuf,
        max_file_size: u64,
        start_timestamp: String,
    ) -> io::Result<Self> {
        let inner = RollingFileInner::open(log_dir, max_file_size, start_timestamp)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// 当前写入的文件
    pub fn current_path(&self) -> PathBuf {
        let inner = self.inner.lock();
        log_file_path(&inner.log_dir, &inner.start_timestamp, inner.current_index)
    }
}

impl Write for RollingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write_data(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush_file()
    }
}

fn log_file_path(log_dir: &Path, start_timestamp: &str, index: u32) -> PathBuf {
    let filename = if index == 0 {
        format!("{}{}{}", LOG_FILE_PREFIX, start_timestamp, LOG_FILE_SUFFIX)
    } else {
        format!(
            "{}{}_{}{}",
            LOG_FILE_PREFIX, start_timestamp, index, LOG_FILE_SUFFIX
        )
    };
    log_dir.join(filename)
}

/// 日志系统守卫
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// 重复初始化（例如测试中）不会 panic，后来的调用不生效
///
/// # 参数
/// * `config` - 日志配置
///
/// # 返回值
/// * `LogGuard` - 日志守卫，需要保持存活直到程序结束
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_ansi(true)
        .boxed();

    if !config.enabled {
        install(env_filter, vec![console_layer]);
        info!("日志系统初始化完成（仅控制台输出）");
        return LogGuard { _file_guard: None };
    }

    let writer = fs::create_dir_all(&config.log_dir)
        .and_then(|_| RollingFileWriter::new(config.log_dir.clone(), config.max_file_size));
    let writer = match writer {
        Ok(writer) => writer,
        Err(e) => {
            eprintln!(
                "创建日志文件失败: {:?}, 错误: {}, 回退到仅控制台输出",
                config.log_dir, e
            );
            install(env_filter, vec![console_layer]);
            return LogGuard { _file_guard: None };
        }
    };

    let (non_blocking, file_guard) = tracing_appender::non_blocking(writer);

    // 文件输出层（不带 ANSI 颜色）
    let file_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(non_blocking)
        .boxed();

    install(env_filter, vec![console_layer, file_layer]);

    info!(
        "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
        config.log_dir,
        config.retention_days,
        config.level,
        config.max_file_size as f64 / 1024.0 / 1024.0
    );

    let deleted = cleanup_old_logs(
        &config.log_dir,
        config.retention_days,
        Local::now().date_naive(),
    );
    if deleted > 0 {
        info!("已清理 {} 个过期日志文件", deleted);
    }

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

fn install(env_filter: EnvFilter, layers: Vec<Box<dyn Layer<Registry> + Send + Sync>>) {
    let result = tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init();
    if let Err(e) = result {
        eprintln!("日志系统已初始化，跳过: {}", e);
    }
}

/// 清理过期日志文件，返回删除的数量
fn cleanup_old_logs(log_dir: &Path, retention_days: u32, today: NaiveDate) -> usize {
    let retention = chrono::Duration::days(retention_days as i64);

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut deleted = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(filename) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !filename.starts_with(LOG_FILE_PREFIX) || !filename.ends_with(LOG_FILE_SUFFIX) {
            continue;
        }

        // 文件名日期优先，解析不出时看修改时间
        let expired = match date_from_filename(filename) {
            Some(date) => today.signed_duration_since(date) > retention,
            None => expired_by_modified_time(&entry, retention),
        };

        if expired {
            match fs::remove_file(&path) {
                Ok(()) => {
                    deleted += 1;
                    tracing::debug!("已删除过期日志文件: {:?}", path);
                }
                Err(e) => tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
            }
        }
    }

    deleted
}

/// statement-upload.YYYY-MM-DD-HHMMSS[_N].log -> YYYY-MM-DD
fn date_from_filename(filename: &str) -> Option<NaiveDate> {
    let name = filename
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_suffix(LOG_FILE_SUFFIX)?;
    let date = name.get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn expired_by_modified_time(entry: &fs::DirEntry, retention: chrono::Duration) -> bool {
    let modified = entry.metadata().and_then(|m| m.modified());
    match modified {
        Ok(modified) => {
            let modified: chrono::DateTime<chrono::Utc> = modified.into();
            chrono::Utc::now().signed_duration_since(modified) > retention
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_date_from_filename() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 9);
        assert_eq!(
            date_from_filename("statement-upload.2024-03-09-101500.log"),
            expected
        );
        assert_eq!(
            date_from_filename("statement-upload.2024-03-09-101500_2.log"),
            expected
        );
        assert_eq!(date_from_filename("statement-upload.garbage.log"), None);
        assert_eq!(date_from_filename("other.2024-03-09.log"), None);
    }

    #[test]
    fn test_rolling_writer_rotates_by_size() {
        let dir = TempDir::new().unwrap();
        let mut writer = RollingFileWriter::with_timestamp(
            dir.path().to_path_buf(),
            16,
            "2024-03-09-101500".to_string(),
        )
        .unwrap();

        writer.write_all(b"0123456789").unwrap();
        writer.write_all(b"0123456789").unwrap();
        writer.flush().unwrap();

        let base = dir.path().join("statement-upload.2024-03-09-101500.log");
        let rolled = dir.path().join("statement-upload.2024-03-09-101500_1.log");
        assert_eq!(fs::read(&base).unwrap().len(), 10);
        assert_eq!(fs::read(&rolled).unwrap().len(), 10);
        assert_eq!(writer.current_path(), rolled);
    }

    #[test]
    fn test_oversized_write_goes_to_empty_file() {
        let dir = TempDir::new().unwrap();
        let mut writer = RollingFileWriter::with_timestamp(
            dir.path().to_path_buf(),
            4,
            "2024-03-09-101500".to_string(),
        )
        .unwrap();

        writer.write_all(b"0123456789").unwrap();
        assert_eq!(
            writer.current_path(),
            dir.path().join("statement-upload.2024-03-09-101500.log")
        );
    }

    #[test]
    fn test_cleanup_old_logs() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("statement-upload.2024-01-01-000000.log");
        let recent = dir.path().join("statement-upload.2024-03-08-120000_1.log");
        let unrelated = dir.path().join("notes.2024-01-01.log");
        for path in [&old, &recent, &unrelated] {
            fs::write(path, b"x").unwrap();
        }

        let today = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let deleted = cleanup_old_logs(dir.path(), 7, today);

        assert_eq!(deleted, 1);
        assert!(!old.exists());
        assert!(recent.exists());
        assert!(unrelated.exists());
    }
}
