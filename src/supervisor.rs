use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::assets::AssetProvider;
use crate::config::RunConfig;
use crate::display::DisplayProvider;
use crate::engine::Encoder;
use crate::error::{Fault, StartError};
use crate::health::{HealthAction, HealthMonitor};
use crate::render::RenderHost;
use crate::signal::{Signal, SignalKind, SignalSink};
use crate::state::{LifecycleState, RetryCounter, SessionKind};

/// 启动超时之外额外留出的余量 (清理残留进程等)
const STARTUP_MARGIN: Duration = Duration::from_secs(5);
const ENCODER_START_TIMEOUT: Duration = Duration::from_secs(15);

/// 监督器最终结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// 操作者请求停止，或编码进程正常结束
    Shutdown,
    /// 重试次数耗尽
    Exhausted,
}

impl Outcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            Outcome::Shutdown => 0,
            Outcome::Exhausted => 1,
        }
    }
}

/// 一个恢复周期的结束原因
#[derive(Debug)]
enum CycleEnd {
    Shutdown,
    Rotate,
    Fault(Fault),
}

/// 监督器：唯一持有生命周期状态与重试计数的一方
///
/// # 任务流程：
/// - 按 Display → Renderer → Encoder 顺序启动
/// - 推流期间等待取消、故障信号、健康采样与定时轮换
/// - 任一周期结束时按相反顺序无条件拆除
/// - 故障计入重试次数，轮换不计入；耗尽后终止
pub struct Supervisor<D, R, E, A> {
    cfg: Arc<RunConfig>,
    display: D,
    renderer: R,
    encoder: E,
    assets: A,
    retries: RetryCounter,
    state: LifecycleState,
    history: Vec<LifecycleState>,
    /// 当前恢复周期编号，旧周期的信号一律丢弃
    generation: u64,
    tx: mpsc::UnboundedSender<Signal>,
    rx: mpsc::UnboundedReceiver<Signal>,
}

impl<D, R, E, A> Supervisor<D, R, E, A>
where
    D: DisplayProvider,
    R: RenderHost,
    E: Encoder,
    A: AssetProvider,
{
    pub fn new(cfg: Arc<RunConfig>, display: D, renderer: R, encoder: E, assets: A) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            retries: RetryCounter::new(cfg.retry.max_retries),
            cfg,
            display,
            renderer,
            encoder,
            assets,
            state: LifecycleState::Idle,
            history: vec![LifecycleState::Idle],
            generation: 0,
            tx,
            rx,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// 经历过的状态 (含初始 Idle)
    pub fn state_history(&self) -> &[LifecycleState] {
        &self.history
    }

    pub fn retry_count(&self) -> u32 {
        self.retries.count()
    }

    fn transition(&mut self, next: LifecycleState) {
        if self.state != next {
            info!("Supervisor: {} -> {}", self.state, next);
        }
        self.state = next;
        self.history.push(next);
    }

    /// 运行直到取消或重试耗尽
    pub async fn run(&mut self, cancel: CancellationToken) -> Outcome {
        info!(
            "Supervisor started: {} -> {} ({}, max retries {})",
            self.cfg.url, self.cfg.destination, self.cfg.resolution, self.cfg.retry.max_retries
        );

        loop {
            self.generation += 1;
            let end = self.run_cycle(&cancel).await;

            // --- 拆除：任何结束原因都先按逆序停止全部组件 ---
            if !matches!(end, CycleEnd::Shutdown) {
                self.transition(LifecycleState::Recovering);
            }
            self.teardown().await;

            match end {
                CycleEnd::Shutdown => {
                    self.transition(LifecycleState::Terminated);
                    return Outcome::Shutdown;
                }
                CycleEnd::Rotate => {
                    info!("Scheduled rotation, restarting the pipeline");
                }
                CycleEnd::Fault(fault) => {
                    if !self.retries.try_increment() {
                        error!(
                            kind = fault.as_label(),
                            cause = fault.cause_label(),
                            "{}; reached max retry attempts ({}). Giving up.",
                            fault,
                            self.retries.max()
                        );
                        self.transition(LifecycleState::Terminated);
                        return Outcome::Exhausted;
                    }
                    warn!(
                        kind = fault.as_label(),
                        cause = fault.cause_label(),
                        "{}. Retry {}/{}.",
                        fault,
                        self.retries.count(),
                        self.retries.max()
                    );
                }
            }

            // --- 回退等待，可被取消 ---
            let delay = self.cfg.retry.delay_for(self.retries.count());
            info!("Restarting in {:?}", delay);
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shutdown requested during backoff");
                    self.transition(LifecycleState::Terminated);
                    return Outcome::Shutdown;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_cycle(&mut self, cancel: &CancellationToken) -> CycleEnd {
        let sink = SignalSink::new(self.generation, self.tx.clone());
        let resolution = self.cfg.resolution;

        // --- 阶段 1: 显示表面 ---
        self.transition(LifecycleState::DisplayStarting);
        let limit = self.cfg.display.ready_timeout() + STARTUP_MARGIN;
        match bounded(cancel, limit, self.display.start(resolution, sink.clone())).await {
            None => return CycleEnd::Shutdown,
            Some(Err(e)) => return startup_fault(SessionKind::Display, e),
            Some(Ok(())) => {}
        }

        // --- 阶段 2: 渲染页面 ---
        self.transition(LifecycleState::RendererStarting);
        let limit = self.cfg.browser.start_timeout() + STARTUP_MARGIN;
        let started = self.renderer.start(
            &self.cfg.url,
            resolution,
            self.cfg.audio_enabled,
            sink.clone(),
        );
        match bounded(cancel, limit, started).await {
            None => return CycleEnd::Shutdown,
            Some(Err(e)) => return startup_fault(SessionKind::Renderer, e),
            Some(Ok(())) => {}
        }

        // --- 阶段 3: 音频素材与编码推流 ---
        let plan = tokio::select! {
            _ = cancel.cancelled() => return CycleEnd::Shutdown,
            plan = self.assets.prepare(self.cfg.audio_enabled) => plan,
        };
        let surface = self.display.surface();
        let started = self.encoder.start(
            &surface,
            resolution,
            &plan,
            &self.cfg.destination,
            sink,
        );
        match bounded(cancel, ENCODER_START_TIMEOUT, started).await {
            None => return CycleEnd::Shutdown,
            Some(Err(e)) => return startup_fault(SessionKind::Encoder, e),
            Some(Ok(())) => {}
        }

        self.transition(LifecycleState::Streaming);
        self.retries.reset();
        info!("Streaming {} to {}", self.cfg.url, self.cfg.destination);

        self.stream(cancel).await
    }

    /// 推流阶段：返回即离开 Streaming，健康采样与轮换计时随之释放
    async fn stream(&mut self, cancel: &CancellationToken) -> CycleEnd {
        let mut monitor = HealthMonitor::new(self.cfg.health);
        let period = monitor.config().period;
        let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let rotation = self.cfg.rotation_interval;
        let rotate = async move {
            match rotation {
                Some(interval) => tokio::time::sleep(interval).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(rotate);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shutdown requested while streaming");
                    return CycleEnd::Shutdown;
                }
                Some(signal) = self.rx.recv() => {
                    if signal.generation != self.generation {
                        debug!("Ignoring signal from cycle {}: {:?}", signal.generation, signal.kind);
                        continue;
                    }
                    return match signal.kind {
                        SignalKind::Exited { session: SessionKind::Encoder, exit } if exit.success() => {
                            info!("Encoder finished normally ({}), shutting down", exit);
                            CycleEnd::Shutdown
                        }
                        SignalKind::Exited { session, exit } => {
                            CycleEnd::Fault(Fault::Exited { session, exit })
                        }
                        SignalKind::RendererFault(line) => CycleEnd::Fault(Fault::Renderer(line)),
                    };
                }
                _ = ticks.tick() => {
                    let sample = tokio::select! {
                        _ = cancel.cancelled() => return CycleEnd::Shutdown,
                        sample = self.renderer.capture_fingerprint() => sample,
                    };
                    let sample = match sample {
                        Ok(sample) => sample,
                        Err(e) => {
                            warn!("Health sample skipped: {:#}", e);
                            continue;
                        }
                    };
                    match monitor.observe(sample) {
                        HealthAction::Baseline | HealthAction::Changed => {}
                        HealthAction::Unchanged(n) => {
                            info!("Page unchanged for {} consecutive samples", n);
                        }
                        HealthAction::ForceReload if monitor.should_escalate() => {
                            return CycleEnd::Fault(Fault::Stalled {
                                reloads: monitor.consecutive_reloads(),
                            });
                        }
                        HealthAction::ForceReload => {
                            warn!("Page appears stalled, forcing reload");
                            let reloaded = tokio::select! {
                                _ = cancel.cancelled() => return CycleEnd::Shutdown,
                                reloaded = self.renderer.force_reload() => reloaded,
                            };
                            if let Err(e) = reloaded {
                                return CycleEnd::Fault(Fault::ReloadFailed(format!("{:#}", e)));
                            }
                        }
                    }
                }
                _ = &mut rotate => {
                    return CycleEnd::Rotate;
                }
            }
        }
    }

    /// 逆序停止全部组件，每一步都会执行
    async fn teardown(&mut self) {
        self.encoder.stop().await;
        self.assets.cleanup().await;
        self.renderer.stop().await;
        self.display.stop().await;

        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!("Dropped {} signal(s) raised during teardown", dropped);
        }
    }
}

fn startup_fault(component: SessionKind, source: StartError) -> CycleEnd {
    CycleEnd::Fault(Fault::Startup { component, source })
}

/// 带超时与取消的启动步骤；None 表示已取消
async fn bounded<F>(
    cancel: &CancellationToken,
    limit: Duration,
    step: F,
) -> Option<Result<(), StartError>>
where
    F: Future<Output = Result<(), StartError>>,
{
    tokio::select! {
        _ = cancel.cancelled() => None,
        res = tokio::time::timeout(limit, step) => {
            Some(res.unwrap_or(Err(StartError::Timeout { timeout: limit })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::AudioPlan;
    use crate::capture::{Fingerprint, Surface};
    use crate::config::{AppConfig, Overrides, Resolution};
    use crate::engine::Destination;
    use crate::process::ExitInfo;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;
    type SinkSlot = Arc<Mutex<Option<SignalSink>>>;

    fn record(log: &Log, event: &str) {
        log.lock().unwrap().push(event.to_string());
    }

    fn count(log: &Log, event: &str) -> usize {
        log.lock().unwrap().iter().filter(|e| *e == event).count()
    }

    #[derive(Clone, Copy)]
    enum DisplayMode {
        Ready,
        Fail,
        /// 启动永远不返回
        Hang,
    }

    struct FakeDisplay {
        log: Log,
        mode: DisplayMode,
    }

    impl DisplayProvider for FakeDisplay {
        fn surface(&self) -> Surface {
            Surface::X11 {
                display: ":99".into(),
            }
        }

        async fn start(&mut self, _: Resolution, _: SignalSink) -> Result<(), StartError> {
            record(&self.log, "display.start");
            match self.mode {
                DisplayMode::Ready => Ok(()),
                DisplayMode::Fail => Err(StartError::MarkerMissing {
                    marker: "/tmp/.X11-unix/X99".into(),
                }),
                DisplayMode::Hang => std::future::pending().await,
            }
        }

        async fn stop(&mut self) {
            record(&self.log, "display.stop");
        }
    }

    struct FakeRenderer {
        log: Log,
        sink: SinkSlot,
        /// 依次返回的指纹种子，耗尽后重复最后一个
        frames: VecDeque<u8>,
        last: u8,
        reload_fails: bool,
    }

    impl RenderHost for FakeRenderer {
        async fn start(
            &mut self,
            _: &str,
            _: Resolution,
            _: bool,
            sink: SignalSink,
        ) -> Result<(), StartError> {
            record(&self.log, "renderer.start");
            *self.sink.lock().unwrap() = Some(sink);
            Ok(())
        }

        async fn capture_fingerprint(&mut self) -> anyhow::Result<Fingerprint> {
            record(&self.log, "renderer.sample");
            if let Some(next) = self.frames.pop_front() {
                self.last = next;
            }
            Ok(Fingerprint::from_luma(&[self.last.wrapping_mul(16); 16]))
        }

        async fn force_reload(&mut self) -> anyhow::Result<()> {
            record(&self.log, "renderer.reload");
            if self.reload_fails {
                anyhow::bail!("target closed");
            }
            Ok(())
        }

        async fn stop(&mut self) {
            record(&self.log, "renderer.stop");
        }
    }

    struct FakeEncoder {
        log: Log,
        sink: SinkSlot,
        plans: Arc<Mutex<Vec<AudioPlan>>>,
    }

    impl Encoder for FakeEncoder {
        async fn start(
            &mut self,
            _: &Surface,
            _: Resolution,
            plan: &AudioPlan,
            _: &Destination,
            sink: SignalSink,
        ) -> Result<(), StartError> {
            record(&self.log, "encoder.start");
            self.plans.lock().unwrap().push(plan.clone());
            *self.sink.lock().unwrap() = Some(sink);
            Ok(())
        }

        async fn stop(&mut self) {
            record(&self.log, "encoder.stop");
        }
    }

    struct FakeAssets {
        log: Log,
    }

    impl AssetProvider for FakeAssets {
        async fn prepare(&mut self, enabled: bool) -> AudioPlan {
            record(&self.log, "assets.prepare");
            if enabled {
                AudioPlan::Single("/music/a.mp3".into())
            } else {
                AudioPlan::Disabled
            }
        }

        async fn cleanup(&mut self) {
            record(&self.log, "assets.cleanup");
        }
    }

    struct Harness {
        log: Log,
        renderer_sink: SinkSlot,
        encoder_sink: SinkSlot,
        plans: Arc<Mutex<Vec<AudioPlan>>>,
    }

    fn run_config(max_retries: u32, rotation_sec: u64) -> RunConfig {
        AppConfig::default()
            .resolve(Overrides {
                stream_key: Some("test-key".into()),
                max_retries: Some(max_retries),
                rotation_interval_sec: Some(rotation_sec),
                native_display: Some(false),
                ..Overrides::default()
            })
            .unwrap()
    }

    fn supervisor(
        cfg: RunConfig,
        display: DisplayMode,
        frames: Vec<u8>,
        reload_fails: bool,
    ) -> (
        Supervisor<FakeDisplay, FakeRenderer, FakeEncoder, FakeAssets>,
        Harness,
    ) {
        let harness = Harness {
            log: Log::default(),
            renderer_sink: SinkSlot::default(),
            encoder_sink: SinkSlot::default(),
            plans: Arc::default(),
        };
        let sup = Supervisor::new(
            Arc::new(cfg),
            FakeDisplay {
                log: harness.log.clone(),
                mode: display,
            },
            FakeRenderer {
                log: harness.log.clone(),
                sink: harness.renderer_sink.clone(),
                frames: frames.into(),
                last: 0,
                reload_fails,
            },
            FakeEncoder {
                log: harness.log.clone(),
                sink: harness.encoder_sink.clone(),
                plans: harness.plans.clone(),
            },
            FakeAssets {
                log: harness.log.clone(),
            },
        );
        (sup, harness)
    }

    /// 等待第 n 次编码启动，返回该周期的信号发送端
    async fn wait_encoder_start(h: &Harness, n: usize) -> SignalSink {
        loop {
            if count(&h.log, "encoder.start") >= n {
                if let Some(sink) = h.encoder_sink.lock().unwrap().clone() {
                    return sink;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn exited(session: SessionKind, code: i32) -> SignalKind {
        SignalKind::Exited {
            session,
            exit: ExitInfo {
                code: Some(code),
                signal: None,
            },
        }
    }

    fn recoveries(sup: &Supervisor<FakeDisplay, FakeRenderer, FakeEncoder, FakeAssets>) -> usize {
        sup.state_history()
            .iter()
            .filter(|s| **s == LifecycleState::Recovering)
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn display_failures_exhaust_retries() {
        let (mut sup, h) = supervisor(run_config(3, 0), DisplayMode::Fail, vec![], false);
        let started = Instant::now();

        let outcome = sup.run(CancellationToken::new()).await;

        assert_eq!(outcome, Outcome::Exhausted);
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(count(&h.log, "display.start"), 4);
        assert_eq!(count(&h.log, "renderer.start"), 0);
        assert_eq!(started.elapsed(), Duration::from_secs(15));
        assert_eq!(sup.state(), LifecycleState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_display_start_times_out_and_counts() {
        let (mut sup, h) = supervisor(run_config(1, 0), DisplayMode::Hang, vec![], false);
        let started = Instant::now();

        let outcome = sup.run(CancellationToken::new()).await;

        // 每次启动在 ready_timeout (2s) + 5s 后超时，中间回退 5s
        assert_eq!(outcome, Outcome::Exhausted);
        assert_eq!(count(&h.log, "display.start"), 2);
        assert_eq!(count(&h.log, "display.stop"), 2);
        assert_eq!(count(&h.log, "renderer.start"), 0);
        assert_eq!(sup.retry_count(), 1);
        assert_eq!(started.elapsed(), Duration::from_secs(19));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_terminates_on_first_failure() {
        let (mut sup, h) = supervisor(run_config(0, 0), DisplayMode::Fail, vec![], false);
        let outcome = sup.run(CancellationToken::new()).await;
        assert_eq!(outcome, Outcome::Exhausted);
        assert_eq!(count(&h.log, "display.start"), 1);
        // 启动失败后同样执行完整拆除
        assert_eq!(count(&h.log, "encoder.stop"), 1);
        assert_eq!(count(&h.log, "display.stop"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_encoder_exit_shuts_down_without_recovery() {
        let (mut sup, h) = supervisor(run_config(3, 0), DisplayMode::Ready, vec![], false);
        let driver = async {
            wait_encoder_start(&h, 1).await.send(exited(SessionKind::Encoder, 0));
        };

        let (outcome, ()) = tokio::join!(sup.run(CancellationToken::new()), driver);

        assert_eq!(outcome, Outcome::Shutdown);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(recoveries(&sup), 0);
        assert_eq!(count(&h.log, "encoder.start"), 1);
        assert_eq!(
            sup.state_history(),
            [
                LifecycleState::Idle,
                LifecycleState::DisplayStarting,
                LifecycleState::RendererStarting,
                LifecycleState::Streaming,
                LifecycleState::Terminated,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_order() {
        let (mut sup, h) = supervisor(run_config(3, 0), DisplayMode::Ready, vec![], false);
        let cancel = CancellationToken::new();
        let driver = async {
            wait_encoder_start(&h, 1).await;
            cancel.cancel();
        };

        let (outcome, ()) = tokio::join!(sup.run(cancel.clone()), driver);

        assert_eq!(outcome, Outcome::Shutdown);
        assert_eq!(
            *h.log.lock().unwrap(),
            [
                "display.start",
                "renderer.start",
                "assets.prepare",
                "encoder.start",
                "encoder.stop",
                "assets.cleanup",
                "renderer.stop",
                "display.stop",
            ]
        );
        assert!(matches!(h.plans.lock().unwrap()[0], AudioPlan::Disabled));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_signals_cause_one_recovery() {
        let (mut sup, h) = supervisor(run_config(3, 0), DisplayMode::Ready, vec![], false);
        let cancel = CancellationToken::new();
        let driver = async {
            let first = wait_encoder_start(&h, 1).await;
            first.send(exited(SessionKind::Encoder, 1));
            first.send(SignalKind::RendererFault("Target closed".into()));
            first.send(exited(SessionKind::Display, 1));

            wait_encoder_start(&h, 2).await;
            // 旧周期的信号不再生效
            first.send(exited(SessionKind::Renderer, 1));
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        };

        let (outcome, ()) = tokio::join!(sup.run(cancel.clone()), driver);

        assert_eq!(outcome, Outcome::Shutdown);
        assert_eq!(recoveries(&sup), 1);
        assert_eq!(count(&h.log, "encoder.start"), 2);
        // 成功启动后重试计数清零
        assert_eq!(sup.retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn renderer_fault_triggers_recovery() {
        let (mut sup, h) = supervisor(run_config(3, 0), DisplayMode::Ready, vec![], false);
        let cancel = CancellationToken::new();
        let driver = async {
            wait_encoder_start(&h, 1).await;
            let sink = h.renderer_sink.lock().unwrap().clone().unwrap();
            sink.send(SignalKind::RendererFault("Renderer process crashed".into()));
            wait_encoder_start(&h, 2).await;
            cancel.cancel();
        };

        let (outcome, ()) = tokio::join!(sup.run(cancel.clone()), driver);

        assert_eq!(outcome, Outcome::Shutdown);
        assert_eq!(count(&h.log, "display.start"), 2);
        assert_eq!(count(&h.log, "display.stop"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_restarts_without_counting() {
        // 不允许任何重试：若轮换被计为故障将立即终止
        let (mut sup, h) = supervisor(run_config(0, 100), DisplayMode::Ready, (1..=50).collect(), false);
        let cancel = CancellationToken::new();
        let driver = async {
            wait_encoder_start(&h, 3).await;
            cancel.cancel();
        };

        let (outcome, ()) = tokio::join!(sup.run(cancel.clone()), driver);

        assert_eq!(outcome, Outcome::Shutdown);
        assert_eq!(count(&h.log, "encoder.start"), 3);
        assert_eq!(recoveries(&sup), 2);
        assert_eq!(sup.retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_page_is_reloaded_then_recovered() {
        let (mut sup, h) = supervisor(run_config(3, 0), DisplayMode::Ready, vec![7], false);
        let cancel = CancellationToken::new();
        let started = Instant::now();
        let driver = async {
            wait_encoder_start(&h, 2).await;
            cancel.cancel();
        };

        let (outcome, ()) = tokio::join!(sup.run(cancel.clone()), driver);

        assert_eq!(outcome, Outcome::Shutdown);
        // 60s 基线，120s 未变化，180s 强制刷新，240s 未变化，300s 升级为恢复
        assert_eq!(count(&h.log, "renderer.reload"), 1);
        assert_eq!(count(&h.log, "renderer.sample"), 5);
        assert_eq!(recoveries(&sup), 1);
        assert!(started.elapsed() >= Duration::from_secs(305));
    }

    #[tokio::test(start_paused = true)]
    async fn changing_page_is_never_reloaded() {
        let (mut sup, h) = supervisor(run_config(3, 0), DisplayMode::Ready, (1..=10).collect(), false);
        let cancel = CancellationToken::new();
        let driver = async {
            wait_encoder_start(&h, 1).await;
            tokio::time::sleep(Duration::from_secs(610)).await;
            cancel.cancel();
        };

        let (outcome, ()) = tokio::join!(sup.run(cancel.clone()), driver);

        assert_eq!(outcome, Outcome::Shutdown);
        assert_eq!(count(&h.log, "renderer.sample"), 10);
        assert_eq!(count(&h.log, "renderer.reload"), 0);
        assert_eq!(recoveries(&sup), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reload_is_a_fault() {
        let (mut sup, h) = supervisor(run_config(3, 0), DisplayMode::Ready, vec![4], true);
        let cancel = CancellationToken::new();
        let driver = async {
            wait_encoder_start(&h, 2).await;
            cancel.cancel();
        };

        let (outcome, ()) = tokio::join!(sup.run(cancel.clone()), driver);

        assert_eq!(outcome, Outcome::Shutdown);
        assert_eq!(count(&h.log, "renderer.reload"), 1);
        assert_eq!(recoveries(&sup), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_terminates() {
        let (mut sup, h) = supervisor(run_config(3, 0), DisplayMode::Fail, vec![], false);
        let cancel = CancellationToken::new();
        let driver = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        };

        let (outcome, ()) = tokio::join!(sup.run(cancel.clone()), driver);

        assert_eq!(outcome, Outcome::Shutdown);
        assert_eq!(count(&h.log, "display.start"), 1);
        assert_eq!(sup.state(), LifecycleState::Terminated);
    }
}
