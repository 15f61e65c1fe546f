use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use statement_upload::{
    api::{HttpTransport, TokenStore, UploadApi},
    config::AppConfig,
    logging,
    merge::{MergeCoordinator, MergeObserver, MergeOptions, MergeProgress, StatementClip},
    uploader::{
        CancellationController, ChannelObserver, UploadEngine, UploadEvent, UploadOptions,
        UploadSource, UploadStage,
    },
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// 陈述视频分片上传工具
#[derive(Debug, Parser)]
#[command(name = "statement-upload", version, about)]
struct Cli {
    /// 配置文件路径
    #[arg(long, default_value = "config/app.toml")]
    config: String,

    /// 访问令牌
    #[arg(long, env = "STATEMENT_UPLOAD_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// 覆盖配置中的后端地址
    #[arg(long, env = "STATEMENT_UPLOAD_BASE_URL")]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 上传单个文件
    Upload {
        file: PathBuf,
    },
    /// 续传已有会话
    Resume {
        session_id: String,
        file: PathBuf,
    },
    /// 查询会话状态
    Status {
        session_id: String,
    },
    /// 上传三段陈述并合并
    Merge(MergeArgs),
}

#[derive(Debug, Args)]
struct MergeArgs {
    /// 陈述 #0 文件
    f0: PathBuf,
    /// 陈述 #0 时长（毫秒）
    d0: u64,
    f1: PathBuf,
    d1: u64,
    f2: PathBuf,
    d2: u64,
}

impl MergeArgs {
    fn clips(&self) -> Vec<StatementClip> {
        vec![
            StatementClip::new(0, self.f0.clone(), self.d0),
            StatementClip::new(1, self.f1.clone(), self.d1),
            StatementClip::new(2, self.f2.clone(), self.d2),
        ]
    }
}

/// 以日志输出合并进度，只在整数百分比变化时输出
#[derive(Default)]
struct LoggingMergeObserver {
    last_percent: parking_lot::Mutex<i64>,
}

impl MergeObserver for LoggingMergeObserver {
    fn on_progress(&self, progress: &MergeProgress) {
        let percent = progress.progress_percent.floor() as i64;
        let mut last = self.last_percent.lock();
        if percent != *last {
            *last = percent;
            info!(
                "合并进度: {:?} {}% ({}/{} bytes)",
                progress.stage, percent, progress.uploaded_bytes, progress.total_bytes
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_or_default(&cli.config).await;
    if let Some(base_url) = &cli.base_url {
        config.api.base_url = base_url.clone();
    }
    config.validate().context("配置无效")?;

    let _log_guard = logging::init_logging(&config.log);

    info!("Statement Upload v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let tokens = Arc::new(TokenStore::new());
    if let Some(token) = &cli.token {
        tokens.set(token.clone());
    } else {
        warn!("未提供访问令牌，上传请求将被拒绝");
    }

    let transport = HttpTransport::new(&config.api, tokens)?;
    let api = UploadApi::new(Arc::new(transport), config.api.request_timeout());
    let engine = UploadEngine::new(api.clone());

    // Ctrl-C 触发取消
    let cancel = CancellationController::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("收到中断信号，正在取消...");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Command::Upload { file } => {
            let options = config.upload.to_options();
            run_upload(&engine, file, options, cancel).await
        }
        Command::Resume { session_id, file } => {
            let options = config.upload.to_options().resume(session_id);
            run_upload(&engine, file, options, cancel).await
        }
        Command::Status { session_id } => {
            let status = api
                .status(&session_id, &cancel)
                .await
                .context("查询会话状态失败")?;
            println!("session:   {}", status.session_id);
            println!("status:    {:?}", status.status);
            println!("progress:  {:.1}%", status.progress_percent);
            println!("uploaded:  {:?}", status.uploaded_chunks);
            println!("remaining: {:?}", status.remaining_chunks);
            if let Some(expires_at) = status.expires_at {
                println!("expires:   {}", expires_at.to_rfc3339());
            }
            Ok(())
        }
        Command::Merge(args) => {
            let coordinator = MergeCoordinator::new(engine);
            let options = MergeOptions::default()
                .with_upload(config.upload.to_options())
                .with_mode(config.merge.mode)
                .with_poll(config.merge.to_poll_policy())
                .with_observer(Arc::new(LoggingMergeObserver::default()))
                .with_cancellation(cancel);

            let asset = coordinator
                .upload_and_merge(args.clips(), &options)
                .await
                .context("合并上传失败")?;

            println!("{}", serde_json::to_string_pretty(&asset)?);
            Ok(())
        }
    }
}

/// 上传单个文件，进度事件通过通道打印
async fn run_upload(
    engine: &UploadEngine,
    file: PathBuf,
    options: UploadOptions,
    cancel: CancellationController,
) -> Result<()> {
    let (observer, mut events) = ChannelObserver::channel();
    let options = options
        .with_observer(Arc::new(observer))
        .with_cancellation(cancel);
    let source = UploadSource::from_path(file);

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                UploadEvent::Progress { snapshot } => {
                    if snapshot.stage == UploadStage::Uploading {
                        info!(
                            "{:.1}% ({}/{} bytes, {} B/s)",
                            snapshot.progress_percent,
                            snapshot.uploaded_bytes,
                            snapshot.total_bytes,
                            snapshot.upload_speed_bytes_per_sec
                        );
                    }
                }
                UploadEvent::ChunkComplete { .. } => {}
                UploadEvent::Retry { attempt, error } => {
                    warn!("第 {} 次重试: {}", attempt, error);
                }
            }
        }
    });

    let result = engine.upload(&source, &options).await;
    // 释放发送端，打印任务随之结束
    drop(options);
    let _ = printer.await;

    let result = result.context("上传失败")?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
