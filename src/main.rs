mod assets;
mod capture;
mod config;
mod display;
mod engine;
mod error;
mod health;
mod policy;
mod process;
mod render;
mod shutdown;
mod signal;
mod state;
mod supervisor;

use assets::AudioLibrary;
use capture::FrameGrabber;
use clap::builder::BoolishValueParser;
use clap::Parser;
use config::{AppConfig, Overrides, Platform, RunConfig};
use display::{DisplayProvider, NativeDisplay, VirtualDisplay};
use engine::FfmpegEncoder;
use render::BrowserHost;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use supervisor::{Outcome, Supervisor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// pagecast - 将网页画面持续推流到 RTMP
/// 解析命令行参数与环境变量，加载配置文件，并启动监督器
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 要推流的网页地址
    #[arg(env = "WEBSITE_URL")]
    url: Option<String>,

    /// 串流密钥
    #[arg(env = "YOUTUBE_STREAM_KEY", hide_env_values = true)]
    stream_key: Option<String>,

    /// 配置文件路径 (默认 pagecast.yaml，不存在时使用内置默认值)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 推流服务器地址
    #[arg(long, env = "STREAM_INGEST_URL")]
    ingest_url: Option<String>,

    #[arg(long, env = "RESOLUTION_WIDTH")]
    width: Option<u32>,

    #[arg(long, env = "RESOLUTION_HEIGHT")]
    height: Option<u32>,

    /// 最大重试次数
    #[arg(long, env = "MAX_RETRIES")]
    max_retries: Option<u32>,

    /// 重试间隔 (毫秒)
    #[arg(long, env = "RETRY_DELAY")]
    retry_delay: Option<u64>,

    /// 是否混入背景音乐
    #[arg(long, env = "AUDIO_ENABLED", value_parser = BoolishValueParser::new())]
    audio_enabled: Option<bool>,

    /// 定时轮换间隔 (秒)，0 表示关闭
    #[arg(long, env = "ROTATION_INTERVAL")]
    rotation_interval: Option<u64>,

    /// 使用宿主原生显示而不是 Xvfb
    #[arg(long, value_parser = BoolishValueParser::new())]
    native_display: Option<bool>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            url: self.url.clone(),
            stream_key: self.stream_key.clone(),
            ingest_url: self.ingest_url.clone(),
            width: self.width,
            height: self.height,
            max_retries: self.max_retries,
            retry_delay_ms: self.retry_delay,
            audio_enabled: self.audio_enabled,
            rotation_interval_sec: self.rotation_interval,
            native_display: self.native_display,
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<RunConfig> {
    AppConfig::load_or_default(args.config.as_deref())?.resolve(args.overrides())
}

/// 为选定的显示提供者组装其余组件并运行监督器
async fn run_with<D: DisplayProvider>(
    cfg: Arc<RunConfig>,
    display: D,
    cancel: CancellationToken,
) -> Outcome {
    let grabber = FrameGrabber::new(
        cfg.encoder.ffmpeg_binary.clone(),
        display.surface(),
        cfg.resolution,
        cfg.encoder.framerate,
        cfg.browser.grab_timeout(),
    );
    let renderer = BrowserHost::new(
        cfg.browser.clone(),
        grabber,
        cfg.scratch_dir.join("browser-profile"),
    );
    let encoder = FfmpegEncoder::new(cfg.encoder.clone(), cfg.scratch_dir.clone());
    let assets = AudioLibrary::new(cfg.audio.clone(), &cfg.scratch_dir);

    let mut supervisor = Supervisor::new(cfg, display, renderer, encoder, assets);
    let outcome = supervisor.run(cancel).await;
    info!(
        "Supervisor finished in state {} (retries {})",
        supervisor.state(),
        supervisor.retry_count()
    );
    debug!("State history: {:?}", supervisor.state_history());
    outcome
}

#[tokio::main]
async fn main() -> ExitCode {
    // 初始化日志系统，默认 info，可通过 RUST_LOG 调整
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    // 加载并合并配置
    let cfg = match load_config(&args) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!("Configuration error: {:#}", e);
            return ExitCode::from(2);
        }
    };
    info!(
        "pagecast initialized. Platform: {:?}, scratch dir: {:?}",
        cfg.platform, cfg.scratch_dir
    );

    // 操作者信号统一转换为取消请求
    let cancel = CancellationToken::new();
    shutdown::cancel_on_signal(cancel.clone());

    let outcome = match cfg.platform {
        Platform::NativeDisplay => {
            let display = NativeDisplay::new(cfg.display.screen.clone());
            run_with(cfg.clone(), display, cancel).await
        }
        Platform::VirtualDisplay => {
            let display = VirtualDisplay::new(cfg.display.clone());
            run_with(cfg.clone(), display, cancel).await
        }
    };

    info!("pagecast exiting: {:?}", outcome);
    ExitCode::from(outcome.exit_code())
}
