use anyhow::{anyhow, bail, Context};
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::capture::{Fingerprint, FrameGrabber, Surface};
use crate::config::{BrowserConfig, Resolution};
use crate::error::StartError;
use crate::process::{ExitInfo, ManagedProcess};
use crate::signal::SignalSink;
use crate::state::SessionKind;

const PAINT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const XDOTOOL_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_GRACE: Duration = Duration::from_secs(10);

/// 页面加载后执行的站点适配步骤 (通过 xdotool)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HookStep {
    /// 按键，例如 `space`、`ctrl+r`
    Key { keys: String },
    /// 在表面坐标处单击
    Click { x: i32, y: i32 },
    Wait { ms: u64 },
}

/// 渲染宿主：持有一个浏览器会话，把目标页面绘制到表面上
pub trait RenderHost {
    /// 打开页面并等待至少一帧稳定画面
    async fn start(
        &mut self,
        url: &str,
        resolution: Resolution,
        audio_enabled: bool,
        sink: SignalSink,
    ) -> Result<(), StartError>;

    /// 低成本、低保真的当前画面指纹，仅用于变化检测
    async fn capture_fingerprint(&mut self) -> anyhow::Result<Fingerprint>;

    /// 原地重新加载页面
    async fn force_reload(&mut self) -> anyhow::Result<()>;

    /// 关闭会话，可重复调用
    async fn stop(&mut self);
}

#[derive(Clone)]
struct Launch {
    url: String,
    resolution: Resolution,
    audio_enabled: bool,
    sink: SignalSink,
}

/// 基于 Chromium 系浏览器的渲染宿主
///
/// 浏览器以 kiosk 模式铺满表面，画面变化通过 [`FrameGrabber`] 采样。
pub struct BrowserHost {
    cfg: BrowserConfig,
    grabber: FrameGrabber,
    /// 独立的用户数据目录，避免与残留浏览器实例共享锁
    profile_dir: PathBuf,
    process: Option<ManagedProcess>,
    launch: Option<Launch>,
    /// 本会话写出的校验截图
    snapshot: Option<PathBuf>,
}

impl BrowserHost {
    pub fn new(cfg: BrowserConfig, grabber: FrameGrabber, profile_dir: PathBuf) -> Self {
        Self {
            cfg,
            grabber,
            profile_dir,
            process: None,
            launch: None,
            snapshot: None,
        }
    }

    fn surface(&self) -> &Surface {
        self.grabber.surface()
    }

    async fn spawn(&mut self, launch: &Launch) -> Result<(), StartError> {
        if let Some(mut old) = self.process.take() {
            old.stop(STOP_GRACE).await;
        }

        let mut cmd = Command::new(&self.cfg.binary);
        cmd.args(browser_args(
            &self.cfg,
            &launch.url,
            launch.resolution,
            launch.audio_enabled,
            &self.profile_dir,
        ));
        if let Some(display) = self.surface().display_env() {
            cmd.env("DISPLAY", display);
        }

        let process = ManagedProcess::spawn_watched(
            SessionKind::Renderer,
            cmd,
            Some(launch.sink.clone()),
            self.cfg.fault_patterns.clone(),
        )
        .map_err(StartError::Spawn)?;
        self.process = Some(process);
        Ok(())
    }

    fn ensure_alive(&mut self) -> Result<(), StartError> {
        let Some(process) = self.process.as_mut() else {
            return Err(StartError::Other("browser not running".into()));
        };
        if process.poll_alive() {
            Ok(())
        } else {
            Err(StartError::ExitedEarly {
                exit: process.exit_info().unwrap_or(ExitInfo::UNKNOWN),
            })
        }
    }

    /// 在导航超时内等待第一帧非空白画面
    async fn wait_painted(&mut self) -> Result<Fingerprint, StartError> {
        let timeout = self.cfg.navigation_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            self.ensure_alive()?;
            match self.grabber.fingerprint().await {
                Ok(frame) if !frame.is_blank() => return Ok(frame),
                Ok(_) => debug!("Surface still blank"),
                Err(e) => debug!("Frame grab not ready: {:#}", e),
            }
            if Instant::now() >= deadline {
                return Err(StartError::Timeout { timeout });
            }
            tokio::time::sleep(PAINT_POLL_INTERVAL).await;
        }
    }

    async fn run_hooks(&self) {
        for step in &self.cfg.post_load {
            let result = match step {
                HookStep::Key { keys } => {
                    self.xdotool(&["key", "--clearmodifiers", keys.as_str()])
                        .await
                }
                HookStep::Click { x, y } => {
                    let (x, y) = (x.to_string(), y.to_string());
                    self.xdotool(&["mousemove", x.as_str(), y.as_str(), "click", "1"]).await
                }
                HookStep::Wait { ms } => {
                    tokio::time::sleep(Duration::from_millis(*ms)).await;
                    Ok(())
                }
            };
            if let Err(e) = result {
                warn!("Post-load step {:?} failed, continuing: {:#}", step, e);
            }
        }
    }

    async fn xdotool(&self, args: &[&str]) -> anyhow::Result<()> {
        let display = self
            .surface()
            .display_env()
            .ok_or_else(|| anyhow!("xdotool needs an X display"))?;
        let mut cmd = Command::new(&self.cfg.xdotool_binary);
        cmd.args(args).env("DISPLAY", display).kill_on_drop(true);

        let status = tokio::time::timeout(XDOTOOL_TIMEOUT, cmd.status())
            .await
            .map_err(|_| anyhow!("xdotool timed out"))?
            .context("failed to run xdotool")?;
        if !status.success() {
            bail!("xdotool {:?} exited with {}", args, status);
        }
        Ok(())
    }

    async fn write_snapshot(&mut self) {
        let path = self.cfg.snapshot_path.clone();
        match self.grabber.snapshot(&path).await {
            Ok(()) => {
                info!("Screenshot saved to {:?}", path);
                self.snapshot = Some(path);
            }
            Err(e) => warn!("Failed to save verification screenshot: {:#}", e),
        }
    }

    /// 重新拉起浏览器，用于无法原地刷新的情形
    async fn relaunch(&mut self) -> anyhow::Result<()> {
        let launch = self
            .launch
            .clone()
            .ok_or_else(|| anyhow!("renderer not started"))?;
        info!("Relaunching browser for {}", launch.url);
        self.spawn(&launch).await?;
        self.wait_painted().await?;
        self.run_hooks().await;
        Ok(())
    }
}

impl RenderHost for BrowserHost {
    async fn start(
        &mut self,
        url: &str,
        resolution: Resolution,
        audio_enabled: bool,
        sink: SignalSink,
    ) -> Result<(), StartError> {
        let launch = Launch {
            url: url.to_string(),
            resolution,
            audio_enabled,
            sink,
        };
        self.launch = Some(launch.clone());

        if self.cfg.preflight {
            check_reachable(url, self.cfg.navigation_timeout()).await?;
        }

        info!("Starting browser, navigating to {}", url);
        self.spawn(&launch).await?;
        let first = self.wait_painted().await?;
        debug!("First frame painted ({:?})", first);

        self.run_hooks().await;

        info!("Waiting {:?} for page to settle", self.cfg.settle_delay());
        tokio::time::sleep(self.cfg.settle_delay()).await;
        self.ensure_alive()?;

        let stable = self
            .grabber
            .fingerprint()
            .await
            .map_err(|e| StartError::Other(format!("no stable frame: {:#}", e)))?;
        if stable.is_blank() {
            return Err(StartError::Other("page went blank after settling".into()));
        }
        self.write_snapshot().await;
        info!("Page loaded and rendered ({:?})", stable);
        Ok(())
    }

    async fn capture_fingerprint(&mut self) -> anyhow::Result<Fingerprint> {
        self.grabber.fingerprint().await
    }

    async fn force_reload(&mut self) -> anyhow::Result<()> {
        if self.launch.is_none() {
            bail!("renderer not started");
        }
        if self.surface().display_env().is_some() && self.ensure_alive().is_ok() {
            match self.xdotool(&["key", "--clearmodifiers", "F5"]).await {
                Ok(()) => {
                    info!("Page reloaded in place");
                    return Ok(());
                }
                Err(e) => warn!("In-place reload failed: {:#}", e),
            }
        }
        self.relaunch().await
    }

    async fn stop(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.stop(STOP_GRACE).await;
        }
        self.launch = None;

        if let Some(path) = self.snapshot.take() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Removed screenshot {:?}", path),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove screenshot {:?}: {}", path, e),
            }
        }
        match tokio::fs::remove_dir_all(&self.profile_dir).await {
            Ok(()) => debug!("Removed browser profile {:?}", self.profile_dir),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove browser profile {:?}: {}", self.profile_dir, e),
        }
    }
}

/// 导航前确认页面可达，HTTP 错误状态或连接失败都视为导航失败
async fn check_reachable(url: &str, timeout: Duration) -> Result<(), StartError> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Ok(());
    }
    let agent = ureq::AgentBuilder::new().timeout(timeout).build();
    let target = url.to_string();
    let status = tokio::task::spawn_blocking(move || agent.get(&target).call().map(|r| r.status()))
        .await
        .map_err(|e| StartError::Other(format!("navigation check task failed: {}", e)))?
        .map_err(|e| StartError::Other(format!("navigation to {} failed: {}", url, e)))?;
    debug!("Navigation check for {} returned {}", url, status);
    Ok(())
}

fn browser_args(
    cfg: &BrowserConfig,
    url: &str,
    resolution: Resolution,
    audio_enabled: bool,
    profile_dir: &std::path::Path,
) -> Vec<String> {
    let mut args: Vec<String> = [
        "--no-sandbox",
        "--disable-setuid-sandbox",
        "--disable-gpu",
        "--disable-dev-shm-usage",
        "--disable-web-security",
        "--no-first-run",
        "--no-default-browser-check",
        "--disable-infobars",
        "--disable-session-crashed-bubble",
        "--noerrdialogs",
        "--kiosk",
        "--window-position=0,0",
    ]
    .map(String::from)
    .to_vec();
    args.push(format!(
        "--window-size={},{}",
        resolution.width, resolution.height
    ));
    args.push(format!("--user-data-dir={}", profile_dir.display()));
    if audio_enabled {
        args.push("--autoplay-policy=no-user-gesture-required".into());
    } else {
        args.push("--mute-audio".into());
    }
    args.extend(cfg.extra_args.iter().cloned());
    args.push(url.to_string());
    args
}
