use std::fmt;
use std::time::Instant;

/// 监督器生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Idle,
    DisplayStarting,
    RendererStarting,
    Streaming,
    Recovering,
    Terminated,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::DisplayStarting => "display_starting",
            LifecycleState::RendererStarting => "renderer_starting",
            LifecycleState::Streaming => "streaming",
            LifecycleState::Recovering => "recovering",
            LifecycleState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// 外部进程种类，每种同一时刻最多存活一个
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Display,
    Renderer,
    Encoder,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Display => "display",
            SessionKind::Renderer => "renderer",
            SessionKind::Encoder => "encoder",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Exited,
}

/// 单个存活外部进程的运行时信息
///
/// 由启动它的组件独占持有，其他组件只能看到 ready / failed 信号。
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub kind: SessionKind,
    /// 进程 PID
    pub pid: Option<u32>,
    /// 进程启动时间 (用于计算运行时长)
    pub started_at: Instant,
    /// 最后一次确认存活的时间
    pub last_alive_at: Instant,
    pub state: SessionState,
}

impl SessionHandle {
    pub fn new(kind: SessionKind, pid: Option<u32>) -> Self {
        let now = Instant::now();
        Self {
            kind,
            pid,
            started_at: now,
            last_alive_at: now,
            state: SessionState::Running,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// 连续失败计数，上限为 max，永不越界
#[derive(Debug, Clone)]
pub struct RetryCounter {
    count: u32,
    max: u32,
}

impl RetryCounter {
    pub fn new(max: u32) -> Self {
        Self { count: 0, max }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn exhausted(&self) -> bool {
        self.count >= self.max
    }

    /// 计数加一；已达上限时返回 false 且不修改计数
    pub fn try_increment(&mut self) -> bool {
        if self.exhausted() {
            return false;
        }
        self.count += 1;
        true
    }

    /// 仅在完整启动成功后调用
    pub fn reset(&mut self) {
        self.count = 0;
    }
}
