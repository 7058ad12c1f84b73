use std::time::Duration;

use crate::capture::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    /// 采样周期
    pub period: Duration,
    /// 连续多少次画面未变化后强制刷新
    pub stale_threshold: u32,
    /// 连续强制刷新仍无变化的次数上限，超过后进入完整恢复
    pub reload_escalation: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(60),
            stale_threshold: 2,
            reload_escalation: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    Baseline,
    Changed,
    /// 未变化，附带当前连续次数
    Unchanged(u32),
    ForceReload,
}

#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    last: Option<Fingerprint>,
    unchanged: u32,
    consecutive_reloads: u32,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            last: None,
            unchanged: 0,
            consecutive_reloads: 0,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// 上次画面变化以来的强制刷新次数
    pub fn consecutive_reloads(&self) -> u32 {
        self.consecutive_reloads
    }

    pub fn should_escalate(&self) -> bool {
        self.config.reload_escalation > 0
            && self.consecutive_reloads >= self.config.reload_escalation
    }

    pub fn observe(&mut self, sample: Fingerprint) -> HealthAction {
        let previous = self.last.replace(sample);
        let Some(previous) = previous else {
            return HealthAction::Baseline;
        };

        if self.last.as_ref() != Some(&previous) {
            self.unchanged = 0;
            self.consecutive_reloads = 0;
            return HealthAction::Changed;
        }

        self.unchanged += 1;
        if self.unchanged >= self.config.stale_threshold.max(1) {
            self.unchanged = 0;
            self.consecutive_reloads += 1;
            return HealthAction::ForceReload;
        }
        HealthAction::Unchanged(self.unchanged)
    }
}
