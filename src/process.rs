use anyhow::Context;
use std::collections::VecDeque;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::signal::{SignalKind, SignalSink};
use crate::state::{SessionHandle, SessionKind, SessionState};

/// 保留的最近输出行数 (用于退出时报告)
const TAIL_LINES: usize = 20;

/// 进程退出信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub const UNKNOWN: ExitInfo = ExitInfo {
        code: None,
        signal: None,
    };

    /// 仅退出码为 0 视为正常结束
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

type Tail = Arc<Mutex<VecDeque<String>>>;

/// 输出中出现即视为渲染会话故障的文本片段
#[derive(Clone)]
struct FaultWatch {
    patterns: Arc<[String]>,
    sink: SignalSink,
}

/// 受管外部进程
///
/// 子进程由后台 watcher 任务持有：
/// - 输出逐行转发到 tracing
/// - 非主动停止的退出通过 [`SignalSink`] 通知监督器
/// - `stop` 幂等，且等待时间有上限
pub struct ManagedProcess {
    handle: SessionHandle,
    stop: CancellationToken,
    watcher: Option<JoinHandle<()>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    tail: Tail,
}

impl ManagedProcess {
    pub fn spawn(
        kind: SessionKind,
        cmd: Command,
        sink: Option<SignalSink>,
    ) -> anyhow::Result<Self> {
        Self::spawn_watched(kind, cmd, sink, Vec::new())
    }

    /// 同 [`spawn`](Self::spawn)，输出行包含 `fault_patterns` 中任一片段时发送
    /// [`SignalKind::RendererFault`]
    pub fn spawn_watched(
        kind: SessionKind,
        mut cmd: Command,
        sink: Option<SignalSink>,
        fault_patterns: Vec<String>,
    ) -> anyhow::Result<Self> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {} process", kind))?;
        let pid = child.id();

        let tail: Tail = Arc::new(Mutex::new(VecDeque::with_capacity(TAIL_LINES)));
        let fault_watch = match (&sink, fault_patterns.is_empty()) {
            (Some(sink), false) => Some(FaultWatch {
                patterns: fault_patterns.into(),
                sink: sink.clone(),
            }),
            _ => None,
        };
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(kind, stdout, tail.clone(), fault_watch.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(kind, stderr, tail.clone(), fault_watch));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let stop = CancellationToken::new();
        let watcher = tokio::spawn(watch_child(
            kind,
            child,
            stop.clone(),
            exit_tx,
            sink,
            tail.clone(),
        ));

        info!("Started {} process (pid {:?})", kind, pid);

        Ok(Self {
            handle: SessionHandle::new(kind, pid),
            stop,
            watcher: Some(watcher),
            exit_rx,
            tail,
        })
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    /// 检查进程是否仍在运行，并刷新最后存活时间
    pub fn poll_alive(&mut self) -> bool {
        let alive = self.exit_rx.borrow().is_none();
        if alive {
            self.handle.last_alive_at = Instant::now();
        } else {
            self.handle.state = SessionState::Exited;
        }
        alive
    }

    /// 等待进程退出
    pub async fn wait_exit(&mut self) -> ExitInfo {
        loop {
            if let Some(exit) = *self.exit_rx.borrow_and_update() {
                return exit;
            }
            if self.exit_rx.changed().await.is_err() {
                return self.exit_info().unwrap_or(ExitInfo::UNKNOWN);
            }
        }
    }

    /// 最近的输出行
    pub fn tail(&self) -> Vec<String> {
        self.tail
            .lock()
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 停止进程
    ///
    /// 可重复调用；进程已退出时立即返回，最多等待 `grace`。
    pub async fn stop(&mut self, grace: Duration) {
        self.stop.cancel();
        if let Some(watcher) = self.watcher.take() {
            if tokio::time::timeout(grace, watcher).await.is_err() {
                warn!(
                    "{} process (pid {:?}) did not exit within {:?}",
                    self.handle.kind, self.handle.pid, grace
                );
            } else {
                info!(
                    "{} process stopped after {}s",
                    self.handle.kind,
                    self.handle.uptime_secs()
                );
            }
        }
        self.handle.state = SessionState::Exited;
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn watch_child(
    kind: SessionKind,
    mut child: Child,
    stop: CancellationToken,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    sink: Option<SignalSink>,
    tail: Tail,
) {
    tokio::select! {
        status = child.wait() => {
            let exit = match status {
                Ok(status) => ExitInfo::from_status(status),
                Err(e) => {
                    warn!("Failed to wait on {} process: {}", kind, e);
                    ExitInfo::UNKNOWN
                }
            };
            let last_line = tail.lock().ok().and_then(|t| t.back().cloned());
            if exit.success() {
                info!("{} process exited ({})", kind, exit);
            } else {
                warn!(
                    "{} process exited unexpectedly ({}); last output: {}",
                    kind,
                    exit,
                    last_line.as_deref().unwrap_or("<none>")
                );
            }
            let _ = exit_tx.send(Some(exit));
            if let Some(sink) = sink {
                sink.send(SignalKind::Exited { session: kind, exit });
            }
        }
        _ = stop.cancelled() => {
            if let Err(e) = child.kill().await {
                debug!("Kill {} process: {}", kind, e);
            }
            let exit = child
                .try_wait()
                .ok()
                .flatten()
                .map(ExitInfo::from_status)
                .unwrap_or(ExitInfo::UNKNOWN);
            let _ = exit_tx.send(Some(exit));
        }
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(
    kind: SessionKind,
    reader: R,
    tail: Tail,
    fault_watch: Option<FaultWatch>,
) {
    // 按字节读取：非 UTF-8 输出也必须持续读走，否则子进程会因管道关闭收到 SIGPIPE
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                if line.trim().is_empty() {
                    continue;
                }
                if line.to_ascii_lowercase().contains("error") {
                    warn!(target: "pagecast::child", session = %kind, "{}", line);
                } else {
                    debug!(target: "pagecast::child", session = %kind, "{}", line);
                }
                if let Some(fault_watch) = &fault_watch {
                    if fault_watch.patterns.iter().any(|p| line.contains(p.as_str())) {
                        fault_watch.sink.send(SignalKind::RendererFault(line.clone()));
                    }
                }
                if let Ok(mut tail) = tail.lock() {
                    if tail.len() == TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            Err(e) => {
                debug!("{} output closed: {}", kind, e);
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn unexpected_exit_is_signalled() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut process = ManagedProcess::spawn(
            SessionKind::Encoder,
            sh("exit 3"),
            Some(SignalSink::new(4, tx)),
        )
        .unwrap();

        let signal = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal.generation, 4);
        match signal.kind {
            SignalKind::Exited { session, exit } => {
                assert_eq!(session, SessionKind::Encoder);
                assert_eq!(exit.code, Some(3));
            }
            other => panic!("unexpected signal {:?}", other),
        }
        assert!(!process.poll_alive());
        assert_eq!(process.wait_exit().await.code, Some(3));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_silent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut process = ManagedProcess::spawn(
            SessionKind::Display,
            sh("sleep 30"),
            Some(SignalSink::new(1, tx)),
        )
        .unwrap();
        assert!(process.poll_alive());

        process.stop(Duration::from_secs(5)).await;
        process.stop(Duration::from_secs(5)).await;

        assert!(process.exit_info().is_some());
        assert!(!process.poll_alive());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fault_pattern_in_output_is_signalled() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _process = ManagedProcess::spawn_watched(
            SessionKind::Renderer,
            sh("echo 'FATAL: GPU process isn'\\''t usable. Goodbye.' >&2; sleep 30"),
            Some(SignalSink::new(2, tx)),
            vec!["GPU process isn't usable".to_string()],
        )
        .unwrap();

        let signal = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(signal.kind, SignalKind::RendererFault(ref line) if line.contains("Goodbye")));
    }

    #[tokio::test]
    async fn invalid_utf8_output_keeps_child_alive() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut process = ManagedProcess::spawn(
            SessionKind::Encoder,
            sh("printf 'Title: caf\\351\\n' >&2; sleep 1; \
                i=0; while [ $i -lt 50 ]; do echo line $i; echo err $i >&2; i=$((i+1)); done; \
                sleep 30"),
            Some(SignalSink::new(1, tx)),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(process.poll_alive(), "child died: {:?}", process.exit_info());
        assert!(rx.try_recv().is_err());
        let tail = process.tail();
        assert!(tail.iter().any(|l| l == "err 49" || l == "line 49"));

        process.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn invalid_utf8_is_decoded_lossily() {
        let mut process =
            ManagedProcess::spawn(SessionKind::Encoder, sh("printf 'caf\\351\\n'"), None).unwrap();
        process.wait_exit().await;

        let mut tail = Vec::new();
        for _ in 0..50 {
            tail = process.tail();
            if !tail.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(tail, ["caf\u{FFFD}"]);
    }

    #[tokio::test]
    async fn output_lines_are_kept_in_tail() {
        let mut process =
            ManagedProcess::spawn(SessionKind::Renderer, sh("echo hello; echo world >&2"), None)
                .unwrap();
        process.wait_exit().await;

        let mut tail = Vec::new();
        for _ in 0..50 {
            tail = process.tail();
            if tail.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(tail.contains(&"hello".to_string()));
        assert!(tail.contains(&"world".to_string()));
    }
}
