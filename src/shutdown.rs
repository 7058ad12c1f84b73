use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 等待操作者的停止信号
///
/// unix 下 SIGINT / SIGTERM / SIGQUIT 均视为请求停止，其他平台只监听 Ctrl-C。
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigquit.recv() => info!("Received SIGQUIT"),
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C");
    Ok(())
}

/// 收到停止信号时取消 `cancel`
///
/// 信号监听安装失败时只记录错误，推流继续运行。
pub fn cancel_on_signal(cancel: CancellationToken) {
    tokio::spawn(watch_signal(wait_for_shutdown_signal(), cancel));
}

async fn watch_signal<F>(signal: F, cancel: CancellationToken)
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("Shutting down gracefully...");
            cancel.cancel();
        }
        Err(e) => error!("Failed to install signal handlers: {}; stop the process by kill", e),
    }
}
