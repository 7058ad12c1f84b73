use anyhow::{anyhow, bail, Context};
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::config::Resolution;

/// 浏览器绘制、ffmpeg 采集的目标画面
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Surface {
    /// X 显示，如 `:99`
    X11 { display: String },
    /// 原生显示下的 avfoundation 屏幕编号
    Native { screen: String },
}

impl Surface {
    /// 子进程的 `DISPLAY` 环境变量
    pub fn display_env(&self) -> Option<&str> {
        match self {
            Surface::X11 { display } => Some(display),
            Surface::Native { .. } => None,
        }
    }

    pub fn capture_args(&self, resolution: Resolution, framerate: u32) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        match self {
            Surface::X11 { display } => {
                args.extend(["-f", "x11grab", "-framerate"].map(String::from));
                args.push(framerate.to_string());
                args.push("-video_size".into());
                args.push(resolution.to_string());
                args.extend(["-draw_mouse", "0", "-i"].map(String::from));
                args.push(format!("{}.0", display));
            }
            Surface::Native { screen } => {
                args.extend(["-f", "avfoundation", "-capture_cursor", "1", "-framerate"].map(String::from));
                args.push(framerate.to_string());
                args.push("-i".into());
                args.push(format!("{}:none", screen));
            }
        }
        args
    }
}

impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Surface::X11 { display } => write!(f, "x11 {}", display),
            Surface::Native { screen } => write!(f, "native screen {}", screen),
        }
    }
}

/// 画面指纹，只用于判断画面是否变化
#[derive(Clone, PartialEq, Eq)]
pub struct Fingerprint(Vec<u8>);

impl Fingerprint {
    pub const WIDTH: u32 = 32;
    pub const HEIGHT: u32 = 18;

    /// 由 8 位灰度采样构建，每个采样只保留高 5 位，低位噪声不算变化
    pub fn from_luma(pixels: &[u8]) -> Self {
        Self(pixels.iter().map(|p| p >> 3).collect())
    }

    /// 全部采样相同，即尚未绘制任何内容
    pub fn is_blank(&self) -> bool {
        self.0.windows(2).all(|w| w[0] == w[1])
    }

    /// 日志用的 FNV-1a 短摘要
    pub fn digest(&self) -> String {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in &self.0 {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        format!("{:016x}", hash)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.digest())
    }
}

/// 用 ffmpeg 单次抓取画面
#[derive(Debug, Clone)]
pub struct FrameGrabber {
    ffmpeg: String,
    surface: Surface,
    resolution: Resolution,
    framerate: u32,
    timeout: Duration,
}

impl FrameGrabber {
    pub fn new(
        ffmpeg: impl Into<String>,
        surface: Surface,
        resolution: Resolution,
        framerate: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            surface,
            resolution,
            framerate,
            timeout,
        }
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    pub async fn fingerprint(&self) -> anyhow::Result<Fingerprint> {
        let scale = format!("scale={}:{},format=gray", Fingerprint::WIDTH, Fingerprint::HEIGHT);
        let mut args = self.input_args();
        args.extend(["-frames:v", "1", "-vf"].map(String::from));
        args.push(scale);
        args.extend(["-f", "rawvideo", "pipe:1"].map(String::from));

        let frame = self.run(args).await?;
        let expected = (Fingerprint::WIDTH * Fingerprint::HEIGHT) as usize;
        if frame.len() != expected {
            bail!("short frame grab ({} of {} bytes)", frame.len(), expected);
        }
        Ok(Fingerprint::from_luma(&frame))
    }

    /// 保存当前画面的全分辨率 PNG
    pub async fn snapshot(&self, path: &Path) -> anyhow::Result<()> {
        let mut args = self.input_args();
        args.extend(["-frames:v", "1", "-y"].map(String::from));
        args.push(path.to_string_lossy().into_owned());
        self.run(args).await?;
        Ok(())
    }

    fn input_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-nostats", "-loglevel", "error"]
            .map(String::from)
            .to_vec();
        args.extend(self.surface.capture_args(self.resolution, self.framerate));
        args
    }

    async fn run(&self, args: Vec<String>) -> anyhow::Result<Vec<u8>> {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| anyhow!("frame grab timed out after {:?}", self.timeout))?
            .context("failed to run ffmpeg frame grab")?;

        if !output.status.success() {
            bail!(
                "frame grab failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HD: Resolution = Resolution {
        width: 1280,
        height: 720,
    };

    #[test]
    fn x11_capture_args() {
        let surface = Surface::X11 {
            display: ":99".into(),
        };
        let args = surface.capture_args(HD, 30);
        assert_eq!(
            args,
            [
                "-f", "x11grab", "-framerate", "30", "-video_size", "1280x720", "-draw_mouse",
                "0", "-i", ":99.0"
            ]
        );
        assert_eq!(surface.display_env(), Some(":99"));
    }

    #[test]
    fn native_capture_has_no_display_env() {
        let surface = Surface::Native { screen: "1".into() };
        let args = surface.capture_args(HD, 30);
        assert!(args.contains(&"avfoundation".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("1:none"));
        assert_eq!(surface.display_env(), None);
    }

    #[test]
    fn quantisation_ignores_low_bit_noise() {
        let a = Fingerprint::from_luma(&[16, 64, 200, 201]);
        let b = Fingerprint::from_luma(&[17, 66, 202, 203]);
        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());

        let c = Fingerprint::from_luma(&[16, 64, 200, 240]);
        assert_ne!(a, c);
    }

    #[test]
    fn blank_frame_detection() {
        assert!(Fingerprint::from_luma(&[0; 576]).is_blank());
        assert!(!Fingerprint::from_luma(&[0, 0, 255, 0]).is_blank());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_grab_reports_error() {
        let grabber = FrameGrabber::new(
            "false",
            Surface::X11 {
                display: ":99".into(),
            },
            HD,
            30,
            Duration::from_secs(5),
        );
        assert!(grabber.fingerprint().await.is_err());
    }
}
