use tokio::sync::mpsc;
use tracing::debug;

use crate::process::ExitInfo;
use crate::state::SessionKind;

/// 组件发往监督器的带外通知
#[derive(Debug, Clone)]
pub enum SignalKind {
    /// 外部进程退出（非 stop 主动触发）
    Exited { session: SessionKind, exit: ExitInfo },
    /// 渲染会话的传输层错误（进程本身未必崩溃）
    RendererFault(String),
}

#[derive(Debug, Clone)]
pub struct Signal {
    /// 产生该信号的恢复周期编号
    pub generation: u64,
    pub kind: SignalKind,
}

/// 绑定到某一恢复周期的信号发送端
///
/// 监督器丢弃旧周期的信号，拆除过程中陆续到达的退出事件因此不会触发二次恢复。
#[derive(Debug, Clone)]
pub struct SignalSink {
    generation: u64,
    tx: mpsc::UnboundedSender<Signal>,
}

impl SignalSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<Signal>) -> Self {
        Self { generation, tx }
    }

    pub fn send(&self, kind: SignalKind) {
        let signal = Signal {
            generation: self.generation,
            kind,
        };
        if self.tx.send(signal).is_err() {
            debug!("Supervisor gone, dropping signal");
        }
    }
}
