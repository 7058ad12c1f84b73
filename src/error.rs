use std::time::Duration;
use thiserror::Error;

use crate::process::ExitInfo;
use crate::state::SessionKind;

/// 组件启动阶段的错误
#[derive(Error, Debug)]
pub enum StartError {
    /// 超时仍未确认就绪
    #[error("not ready after {timeout:?}")]
    Timeout { timeout: Duration },

    /// 就绪前进程已退出
    #[error("exited during startup ({exit})")]
    ExitedEarly { exit: ExitInfo },

    /// 进程存活但就绪标志 (如 X socket) 一直未出现
    #[error("readiness marker {marker} missing")]
    MarkerMissing { marker: String },

    #[error("spawn failed: {0:#}")]
    Spawn(anyhow::Error),

    #[error("{0}")]
    Other(String),
}

impl StartError {
    pub fn as_label(&self) -> &'static str {
        match self {
            StartError::Timeout { .. } => "start_timeout",
            StartError::ExitedEarly { .. } => "start_exited_early",
            StartError::MarkerMissing { .. } => "start_marker_missing",
            StartError::Spawn(_) => "start_spawn_failed",
            StartError::Other(_) => "start_failed",
        }
    }
}

/// 触发计数重试的故障
///
/// 原地刷新和定时轮换不属于故障，不会出现在这里。
#[derive(Error, Debug)]
pub enum Fault {
    #[error("{component} failed to start: {source}")]
    Startup {
        component: SessionKind,
        #[source]
        source: StartError,
    },

    #[error("{session} exited ({exit})")]
    Exited { session: SessionKind, exit: ExitInfo },

    #[error("renderer error: {0}")]
    Renderer(String),

    #[error("forced reload failed: {0}")]
    ReloadFailed(String),

    #[error("page still unchanged after {reloads} forced reloads")]
    Stalled { reloads: u32 },
}

impl Fault {
    pub fn as_label(&self) -> &'static str {
        match self {
            Fault::Startup { .. } => "startup_failure",
            Fault::Exited { .. } => "process_exited",
            Fault::Renderer(_) => "renderer_error",
            Fault::ReloadFailed(_) => "reload_failed",
            Fault::Stalled { .. } => "render_stalled",
        }
    }

    /// 启动故障取底层 [`StartError`] 的标签，其余同 [`Fault::as_label`]
    pub fn cause_label(&self) -> &'static str {
        match self {
            Fault::Startup { source, .. } => source.as_label(),
            other => other.as_label(),
        }
    }
}
