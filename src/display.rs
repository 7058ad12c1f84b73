use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::capture::Surface;
use crate::config::{DisplayConfig, Resolution};
use crate::error::StartError;
use crate::process::ManagedProcess;
use crate::signal::SignalSink;
use crate::state::SessionKind;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const STOP_GRACE: Duration = Duration::from_secs(5);

/// 显示表面提供者
pub trait DisplayProvider {
    /// 浏览器绘制、编码器采集的目标
    fn surface(&self) -> Surface;

    /// 启动显示表面并确认就绪
    async fn start(&mut self, resolution: Resolution, sink: SignalSink) -> Result<(), StartError>;

    /// 停止显示表面，可重复调用
    async fn stop(&mut self);
}

/// 宿主自带合成器时使用，启动即就绪
pub struct NativeDisplay {
    screen: String,
}

impl NativeDisplay {
    pub fn new(screen: impl Into<String>) -> Self {
        Self {
            screen: screen.into(),
        }
    }
}

impl DisplayProvider for NativeDisplay {
    fn surface(&self) -> Surface {
        Surface::Native {
            screen: self.screen.clone(),
        }
    }

    async fn start(&mut self, resolution: Resolution, _sink: SignalSink) -> Result<(), StartError> {
        info!("Native display in use ({}), no virtual display needed", resolution);
        Ok(())
    }

    async fn stop(&mut self) {}
}

/// Xvfb 虚拟显示
pub struct VirtualDisplay {
    cfg: DisplayConfig,
    /// X 锁文件所在目录
    lock_dir: PathBuf,
    /// X socket 所在目录，socket 出现即视为就绪
    socket_dir: PathBuf,
    process: Option<ManagedProcess>,
}

impl VirtualDisplay {
    pub fn new(cfg: DisplayConfig) -> Self {
        Self::with_dirs(cfg, "/tmp", "/tmp/.X11-unix")
    }

    pub fn with_dirs(
        cfg: DisplayConfig,
        lock_dir: impl Into<PathBuf>,
        socket_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cfg,
            lock_dir: lock_dir.into(),
            socket_dir: socket_dir.into(),
            process: None,
        }
    }

    fn display_name(&self) -> String {
        format!(":{}", self.cfg.number)
    }

    fn lock_path(&self) -> PathBuf {
        self.lock_dir.join(format!(".X{}-lock", self.cfg.number))
    }

    fn socket_path(&self) -> PathBuf {
        self.socket_dir.join(format!("X{}", self.cfg.number))
    }

    /// pkill -f 使用的扩展正则，显示编号后必须是空格或行尾 (:99 不匹配 :990)
    fn stale_pattern(&self) -> String {
        let mut binary = String::new();
        for c in self.cfg.xvfb_binary.chars() {
            if ".[]()*+?{}|^$\\".contains(c) {
                binary.push('\\');
            }
            binary.push(c);
        }
        format!("{} {}( |$)", binary, self.display_name())
    }

    /// 清理上次崩溃残留的 Xvfb 进程和锁文件 (尽力而为)
    async fn clear_stale(&self) {
        let pattern = self.stale_pattern();
        match Command::new("pkill").arg("-f").arg(&pattern).status().await {
            Ok(status) if status.success() => {
                info!("Terminated stale Xvfb on {}", self.display_name());
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Ok(_) => debug!("No stale Xvfb on {}", self.display_name()),
            Err(e) => debug!("pkill unavailable: {}", e),
        }

        for path in [self.lock_path(), self.socket_path()] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!("Removed stale X artifact {:?}", path),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {:?}: {}", path, e),
            }
        }
    }
}

impl DisplayProvider for VirtualDisplay {
    fn surface(&self) -> Surface {
        Surface::X11 {
            display: self.display_name(),
        }
    }

    async fn start(&mut self, resolution: Resolution, sink: SignalSink) -> Result<(), StartError> {
        self.stop().await;
        self.clear_stale().await;

        info!("Starting Xvfb on {} ({})", self.display_name(), resolution);
        let mut cmd = Command::new(&self.cfg.xvfb_binary);
        cmd.arg(self.display_name())
            .arg("-screen")
            .arg("0")
            .arg(format!("{}x24", resolution))
            .arg("-ac") // 禁用访问控制
            .arg("-nolisten")
            .arg("tcp");

        let marker = self.socket_path();
        let timeout = self.cfg.ready_timeout();
        let process = ManagedProcess::spawn(SessionKind::Display, cmd, Some(sink))
            .map_err(StartError::Spawn)?;
        let process = self.process.insert(process);

        confirm_ready(process, &marker, timeout).await?;
        info!("Xvfb ready on {}", self.display_name());
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.stop(STOP_GRACE).await;
        }
    }
}

/// 在 `timeout` 内轮询：进程存活且就绪标记存在才算成功
async fn confirm_ready(
    process: &mut ManagedProcess,
    marker: &Path,
    timeout: Duration,
) -> Result<(), StartError> {
    let deadline = Instant::now() + timeout;
    loop {
        if !process.poll_alive() {
            let exit = process.wait_exit().await;
            let tail = process.tail();
            if !tail.is_empty() {
                warn!("Display output before exit: {}", tail.join(" | "));
            }
            return Err(StartError::ExitedEarly { exit });
        }
        if tokio::fs::try_exists(marker).await.unwrap_or(false) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(StartError::MarkerMissing {
                marker: marker.display().to_string(),
            });
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
