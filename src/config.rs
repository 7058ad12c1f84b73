use anyhow::{bail, Context};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::Destination;
use crate::health::HealthConfig;
use crate::policy::RetryPolicy;
use crate::render::HookStep;

/// 未指定 --config 时尝试加载的配置文件
pub const DEFAULT_CONFIG_PATH: &str = "pagecast.yaml";

const DEFAULT_URL: &str = "https://cryptotick.live/bitcoin?pm=true";
const DEFAULT_INGEST_URL: &str = "rtmp://a.rtmp.youtube.com/live2";
const DEFAULT_ROTATION_SEC: u64 = 6 * 60 * 60;

/// 采集分辨率
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// 显示表面的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// 宿主自带合成器 (macOS)，无需虚拟显示
    NativeDisplay,
    /// 通过 Xvfb 提供离屏显示
    VirtualDisplay,
}

/// YAML 配置文件
///
/// 可被命令行 / 环境变量覆盖的字段使用 Option，其余字段带默认值。
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub stream: StreamSection,
    pub retry: RetrySection,
    pub rotation: RotationSection,
    pub health: HealthSection,
    pub display: DisplayConfig,
    pub browser: BrowserConfig,
    pub encoder: EncoderConfig,
    pub audio: AudioSection,
    /// 临时文件目录 (播放列表、下载的音频)
    pub scratch_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StreamSection {
    pub url: Option<String>,
    pub stream_key: Option<String>,
    pub ingest_url: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    /// 退避倍数 (1.0 表示固定间隔)
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: None,
            retry_delay_ms: None,
            backoff_factor: 1.0,
            max_delay_ms: 300_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RotationSection {
    /// 定时轮换间隔 (秒)，0 表示关闭
    pub interval_sec: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HealthSection {
    pub sample_period_sec: u64,
    pub stale_threshold: u32,
    pub reload_escalation: u32,
}

impl Default for HealthSection {
    fn default() -> Self {
        let defaults = HealthConfig::default();
        Self {
            sample_period_sec: defaults.period.as_secs(),
            stale_threshold: defaults.stale_threshold,
            reload_escalation: defaults.reload_escalation,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DisplayConfig {
    /// 强制指定是否使用原生显示，未设置时按平台判断
    pub native: Option<bool>,
    /// Xvfb 显示编号
    pub number: u32,
    /// avfoundation 屏幕编号
    pub screen: String,
    pub xvfb_binary: String,
    /// Xvfb 就绪确认的等待上限 (毫秒)
    pub ready_timeout_ms: u64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            native: None,
            number: 99,
            screen: "1".to_string(),
            xvfb_binary: "Xvfb".to_string(),
            ready_timeout_ms: 2000,
        }
    }
}

impl DisplayConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BrowserConfig {
    pub binary: String,
    pub extra_args: Vec<String>,
    pub xdotool_binary: String,
    /// 页面首次出图的等待上限 (毫秒)
    pub navigation_timeout_ms: u64,
    /// 页面加载后的稳定等待 (毫秒)
    pub settle_delay_ms: u64,
    /// 单次截帧超时 (毫秒)
    pub grab_timeout_ms: u64,
    /// 页面加载后执行的适配步骤
    pub post_load: Vec<HookStep>,
    /// 渲染校验截图路径
    pub snapshot_path: PathBuf,
    /// 浏览器输出中出现即视为渲染故障的片段
    pub fault_patterns: Vec<String>,
    /// 启动浏览器前先请求一次页面，不可达时直接判定启动失败
    pub preflight: bool,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            binary: "chromium".to_string(),
            extra_args: Vec::new(),
            xdotool_binary: "xdotool".to_string(),
            navigation_timeout_ms: 60_000,
            settle_delay_ms: 10_000,
            grab_timeout_ms: 10_000,
            post_load: Vec::new(),
            snapshot_path: PathBuf::from("/tmp/page-screenshot.png"),
            fault_patterns: vec![
                "GPU process isn't usable".to_string(),
                "Renderer process crashed".to_string(),
            ],
            preflight: true,
        }
    }
}

impl BrowserConfig {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn grab_timeout(&self) -> Duration {
        Duration::from_millis(self.grab_timeout_ms)
    }

    /// 监督器等待渲染就绪的总上限
    pub fn start_timeout(&self) -> Duration {
        self.navigation_timeout() + self.settle_delay() + self.grab_timeout() * 2
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EncoderConfig {
    pub ffmpeg_binary: String,
    pub framerate: u32,
    pub preset: String,
    pub tune: String,
    pub video_bitrate_kbps: u32,
    pub min_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub bufsize_kbps: u32,
    pub gop: u32,
    pub audio_bitrate_kbps: u32,
    pub audio_sample_rate: u32,
    pub threads: u32,
    /// 追加到输出地址之前的参数
    pub extra_output_args: Vec<String>,
    /// 启动前要求的最小可用内存 (KB)
    pub min_free_memory_kb: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_binary: "ffmpeg".to_string(),
            framerate: 30,
            preset: "ultrafast".to_string(),
            tune: "zerolatency".to_string(),
            video_bitrate_kbps: 6000,
            min_bitrate_kbps: 3000,
            max_bitrate_kbps: 6000,
            bufsize_kbps: 12000,
            gop: 60,
            audio_bitrate_kbps: 128,
            audio_sample_rate: 44100,
            threads: 4,
            extra_output_args: Vec::new(),
            min_free_memory_kb: 65536,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AudioSection {
    pub enabled: Option<bool>,
    /// 本地音频目录
    pub directory: Option<PathBuf>,
    /// 需要下载的音频地址
    pub urls: Vec<String>,
    /// 单次编码会话最多使用的曲目数
    pub max_tracks: usize,
    pub download_timeout_sec: u64,
}

impl Default for AudioSection {
    fn default() -> Self {
        Self {
            enabled: None,
            directory: None,
            urls: Vec::new(),
            max_tracks: 20,
            download_timeout_sec: 30,
        }
    }
}

/// 来自命令行 / 环境变量的覆盖值，优先级高于配置文件
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub url: Option<String>,
    pub stream_key: Option<String>,
    pub ingest_url: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub audio_enabled: Option<bool>,
    pub rotation_interval_sec: Option<u64>,
    pub native_display: Option<bool>,
}

/// 解析后的运行配置，启动后不再修改
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub url: String,
    pub destination: Destination,
    pub resolution: Resolution,
    pub audio_enabled: bool,
    pub retry: RetryPolicy,
    /// None 表示不做定时轮换
    pub rotation_interval: Option<Duration>,
    pub health: HealthConfig,
    pub platform: Platform,
    pub display: DisplayConfig,
    pub browser: BrowserConfig,
    pub encoder: EncoderConfig,
    pub audio: AudioSection,
    pub scratch_dir: PathBuf,
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = serde_yaml::from_str(&content)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    /// 显式指定的文件必须存在；默认路径不存在时使用内置默认值
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::load(DEFAULT_CONFIG_PATH),
            None => Ok(Self::default()),
        }
    }

    /// 合并覆盖值：命令行/环境变量 > 配置文件 > 内置默认值
    pub fn resolve(self, overrides: Overrides) -> anyhow::Result<RunConfig> {
        let url = overrides
            .url
            .or(self.stream.url)
            .unwrap_or_else(|| DEFAULT_URL.to_string());
        let stream_key = overrides
            .stream_key
            .or(self.stream.stream_key)
            .filter(|k| !k.trim().is_empty())
            .context("stream key is required (argument or YOUTUBE_STREAM_KEY)")?;
        let ingest_url = overrides
            .ingest_url
            .or(self.stream.ingest_url)
            .unwrap_or_else(|| DEFAULT_INGEST_URL.to_string());

        let defaults = Resolution::default();
        let resolution = Resolution {
            width: overrides.width.or(self.stream.width).unwrap_or(defaults.width),
            height: overrides
                .height
                .or(self.stream.height)
                .unwrap_or(defaults.height),
        };
        if resolution.width == 0 || resolution.height == 0 {
            bail!("invalid resolution {}", resolution);
        }
        if resolution.width % 2 != 0 || resolution.height % 2 != 0 {
            bail!("resolution {} must have even dimensions", resolution);
        }

        let retry_defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_retries: overrides
                .max_retries
                .or(self.retry.max_retries)
                .unwrap_or(retry_defaults.max_retries),
            delay: overrides
                .retry_delay_ms
                .or(self.retry.retry_delay_ms)
                .map(Duration::from_millis)
                .unwrap_or(retry_defaults.delay),
            factor: self.retry.backoff_factor,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        };

        let rotation_sec = overrides
            .rotation_interval_sec
            .or(self.rotation.interval_sec)
            .unwrap_or(DEFAULT_ROTATION_SEC);
        let rotation_interval = (rotation_sec > 0).then(|| Duration::from_secs(rotation_sec));

        if self.health.sample_period_sec == 0 {
            bail!("health.sample_period_sec must be positive");
        }
        let health = HealthConfig {
            period: Duration::from_secs(self.health.sample_period_sec),
            stale_threshold: self.health.stale_threshold,
            reload_escalation: self.health.reload_escalation,
        };

        let native = overrides
            .native_display
            .or(self.display.native)
            .unwrap_or(cfg!(target_os = "macos"));
        let platform = if native {
            Platform::NativeDisplay
        } else {
            Platform::VirtualDisplay
        };

        let audio_enabled = overrides
            .audio_enabled
            .or(self.audio.enabled)
            .unwrap_or(false);

        Ok(RunConfig {
            url,
            destination: Destination::new(ingest_url, stream_key),
            resolution,
            audio_enabled,
            retry,
            rotation_interval,
            health,
            platform,
            display: self.display,
            browser: self.browser,
            encoder: self.encoder,
            audio: self.audio,
            scratch_dir: self
                .scratch_dir
                .unwrap_or_else(|| std::env::temp_dir().join("pagecast")),
        })
    }
}
