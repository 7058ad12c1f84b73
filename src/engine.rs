use anyhow::Context;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::assets::AudioPlan;
use crate::capture::Surface;
use crate::config::{EncoderConfig, Resolution};
use crate::error::StartError;
use crate::process::ManagedProcess;
use crate::signal::SignalSink;
use crate::state::SessionKind;

const STOP_GRACE: Duration = Duration::from_secs(10);
const PLAYLIST_FILE: &str = "playlist.ffconcat";

/// 推流目的地
///
/// 串流密钥不会出现在日志里，Display / Debug 输出均已脱敏。
#[derive(Clone, PartialEq, Eq)]
pub struct Destination {
    endpoint: String,
    key: String,
}

impl Destination {
    pub fn new(endpoint: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            key: key.into(),
        }
    }

    /// 完整推流地址 (含密钥)
    pub fn url(&self) -> String {
        format!("{}/{}", self.endpoint.trim_end_matches('/'), self.key)
    }

    fn redact(&self, text: &str) -> String {
        if self.key.is_empty() {
            text.to_string()
        } else {
            text.replace(&self.key, "****")
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/****", self.endpoint.trim_end_matches('/'))
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Destination({})", self)
    }
}

/// 编码进程：采集表面、混入音频并推流
///
/// 编码进程从不自行重启，重启只由监督器负责。
pub trait Encoder {
    async fn start(
        &mut self,
        surface: &Surface,
        resolution: Resolution,
        plan: &AudioPlan,
        destination: &Destination,
        sink: SignalSink,
    ) -> Result<(), StartError>;

    /// 停止编码，可重复调用
    async fn stop(&mut self);
}

/// 基于 FFmpeg 的编码进程
pub struct FfmpegEncoder {
    cfg: EncoderConfig,
    scratch_dir: PathBuf,
    process: Option<ManagedProcess>,
    /// 本会话写出的播放列表描述文件
    playlist: Option<PathBuf>,
}

impl FfmpegEncoder {
    pub fn new(cfg: EncoderConfig, scratch_dir: PathBuf) -> Self {
        Self {
            cfg,
            scratch_dir,
            process: None,
            playlist: None,
        }
    }

    /// 检查系统内存是否足够
    fn check_memory(&self) -> Result<(), StartError> {
        if self.cfg.min_free_memory_kb == 0 {
            return Ok(());
        }
        match sys_info::mem_info() {
            Ok(mem) if mem.avail < self.cfg.min_free_memory_kb => Err(StartError::Other(format!(
                "insufficient system memory ({} KB available)",
                mem.avail
            ))),
            Ok(_) => Ok(()),
            Err(e) => {
                // 无法获取内存信息时仅记录警告，不阻断流程
                warn!("Failed to check memory usage: {}", e);
                Ok(())
            }
        }
    }

    async fn write_playlist(&mut self, tracks: &[PathBuf]) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.scratch_dir)
            .await
            .with_context(|| format!("failed to create {:?}", self.scratch_dir))?;
        let path = self.scratch_dir.join(PLAYLIST_FILE);
        fs::write(&path, playlist_descriptor(tracks))
            .await
            .with_context(|| format!("failed to write {:?}", path))?;
        self.playlist = Some(path.clone());
        Ok(path)
    }

    async fn remove_playlist(&mut self) {
        if let Some(path) = self.playlist.take() {
            match fs::remove_file(&path).await {
                Ok(()) => debug!("Removed playlist {:?}", path),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove playlist {:?}: {}", path, e),
            }
        }
    }
}

impl Encoder for FfmpegEncoder {
    /// 启动推流
    ///
    /// # 副作用
    /// - 启动 FFmpeg 子进程
    /// - 多曲目时在临时目录写入播放列表
    ///
    /// # 错误处理
    /// - 内存不足时返回错误
    /// - 播放列表写入失败时返回错误
    /// - FFmpeg 启动失败时返回错误
    async fn start(
        &mut self,
        surface: &Surface,
        resolution: Resolution,
        plan: &AudioPlan,
        destination: &Destination,
        sink: SignalSink,
    ) -> Result<(), StartError> {
        // 1. 同一时刻只允许一个编码进程
        self.stop().await;

        // 2. 检查系统内存
        self.check_memory()?;

        // 3. 准备播放列表
        let playlist = match plan {
            AudioPlan::Playlist(tracks) => Some(
                self.write_playlist(tracks)
                    .await
                    .map_err(|e| StartError::Other(format!("{:#}", e)))?,
            ),
            _ => None,
        };

        // 4. 构建 FFmpeg 命令并启动子进程
        let args = build_args(
            &self.cfg,
            surface,
            resolution,
            plan,
            playlist.as_deref(),
            &destination.url(),
        );
        info!("Starting FFmpeg stream to {} from {}", destination, surface);
        debug!("FFmpeg args: {}", destination.redact(&args.join(" ")));

        let mut cmd = Command::new(&self.cfg.ffmpeg_binary);
        cmd.args(&args);
        if let Some(display) = surface.display_env() {
            cmd.env("DISPLAY", display);
        }

        let process = ManagedProcess::spawn(SessionKind::Encoder, cmd, Some(sink))
            .map_err(StartError::Spawn)?;
        self.process = Some(process);
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.stop(STOP_GRACE).await;
            info!("FFmpeg stream stopped.");
        }
        self.remove_playlist().await;
    }
}

/// ffconcat 播放列表内容
fn playlist_descriptor(tracks: &[PathBuf]) -> String {
    let mut out = String::from("ffconcat version 1.0\n");
    for track in tracks {
        let escaped = track.to_string_lossy().replace('\'', r"'\''");
        out.push_str(&format!("file '{}'\n", escaped));
    }
    out
}

/// 构建 FFmpeg 参数
///
/// 输入 0 为表面画面，输入 1 为音频；音频关闭时使用 lavfi 生成静音，不引用任何音频文件。
pub fn build_args(
    cfg: &EncoderConfig,
    surface: &Surface,
    resolution: Resolution,
    plan: &AudioPlan,
    playlist: Option<&Path>,
    url: &str,
) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-nostats", "-loglevel", "info"]
        .map(String::from)
        .to_vec();

    args.extend(surface.capture_args(resolution, cfg.framerate));

    match (plan, playlist) {
        (AudioPlan::Single(track), _) => {
            args.extend(["-stream_loop", "-1", "-i"].map(String::from));
            args.push(track.to_string_lossy().into_owned());
        }
        (AudioPlan::Playlist(_), Some(list)) => {
            args.extend(["-f", "concat", "-safe", "0", "-stream_loop", "-1", "-i"].map(String::from));
            args.push(list.to_string_lossy().into_owned());
        }
        _ => {
            args.extend(["-f", "lavfi", "-i"].map(String::from));
            args.push(format!("anullsrc=r={}:cl=stereo", cfg.audio_sample_rate));
        }
    }

    args.extend(["-map", "0:v:0", "-map", "1:a:0"].map(String::from));

    let kbps = |v: u32| format!("{}k", v);
    args.extend([
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        cfg.preset.clone(),
        "-tune".to_string(),
        cfg.tune.clone(),
        "-b:v".to_string(),
        kbps(cfg.video_bitrate_kbps),
        "-minrate".to_string(),
        kbps(cfg.min_bitrate_kbps),
        "-maxrate".to_string(),
        kbps(cfg.max_bitrate_kbps),
        "-bufsize".to_string(),
        kbps(cfg.bufsize_kbps),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-g".to_string(),
        cfg.gop.to_string(),
        "-keyint_min".to_string(),
        cfg.gop.to_string(),
        "-force_key_frames".to_string(),
        "expr:gte(t,n_forced*2)".to_string(),
        "-sc_threshold".to_string(),
        "0".to_string(),
        "-fps_mode".to_string(),
        "cfr".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        kbps(cfg.audio_bitrate_kbps),
        "-ar".to_string(),
        cfg.audio_sample_rate.to_string(),
        "-threads".to_string(),
        cfg.threads.to_string(),
    ]);
    args.extend(cfg.extra_output_args.iter().cloned());
    args.extend(["-f", "flv", "-flvflags", "no_duration_filesize"].map(String::from));
    args.push(url.to_string());
    args
}
