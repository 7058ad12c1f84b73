use anyhow::Context;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::AudioSection;

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "aac", "ogg", "opus", "wav", "flac"];

/// 单次编码会话使用的音频方案
///
/// 音频是可选的：下载或扫描失败只会减少曲目或退化为静音，不会报告为故障。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioPlan {
    Disabled,
    Single(PathBuf),
    /// 按顺序拼接播放
    Playlist(Vec<PathBuf>),
}

impl AudioPlan {
    pub fn from_tracks(mut tracks: Vec<PathBuf>) -> Self {
        match tracks.len() {
            0 => AudioPlan::Disabled,
            1 => AudioPlan::Single(tracks.remove(0)),
            _ => AudioPlan::Playlist(tracks),
        }
    }

    pub fn sources(&self) -> &[PathBuf] {
        match self {
            AudioPlan::Disabled => &[],
            AudioPlan::Single(path) => std::slice::from_ref(path),
            AudioPlan::Playlist(paths) => paths,
        }
    }
}

pub trait AssetProvider {
    /// 为下一次编码会话准备音频，不会失败
    async fn prepare(&mut self, enabled: bool) -> AudioPlan;

    async fn cleanup(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TrackSource {
    Local(PathBuf),
    Remote(String),
}

impl TrackSource {
    fn id(&self) -> String {
        match self {
            TrackSource::Local(path) => path.to_string_lossy().into_owned(),
            TrackSource::Remote(url) => url.clone(),
        }
    }
}

/// 本轮已播放过的曲目
#[derive(Debug, Clone, Default)]
pub struct AssetHistory {
    played: HashSet<String>,
}

impl AssetHistory {
    pub fn played(&self) -> usize {
        self.played.len()
    }

    /// 随机挑选至多 `limit` 首未播放曲目，全部播放过后开始新一轮
    pub fn select<R: Rng>(
        mut self,
        candidates: &[TrackSource],
        limit: usize,
        rng: &mut R,
    ) -> (Vec<TrackSource>, AssetHistory) {
        let mut fresh: Vec<TrackSource> = candidates
            .iter()
            .filter(|c| !self.played.contains(&c.id()))
            .cloned()
            .collect();
        if fresh.is_empty() {
            self.played.clear();
            fresh = candidates.to_vec();
        }

        fresh.shuffle(rng);
        fresh.truncate(limit.max(1));
        for track in &fresh {
            self.played.insert(track.id());
        }
        (fresh, self)
    }
}

/// 本地目录加远程地址的曲库，随机不重复
pub struct AudioLibrary {
    cfg: AudioSection,
    download_dir: PathBuf,
    history: AssetHistory,
    rng: StdRng,
    downloaded: Vec<PathBuf>,
}

impl AudioLibrary {
    pub fn new(cfg: AudioSection, scratch_dir: &Path) -> Self {
        Self::with_rng(cfg, scratch_dir, StdRng::from_entropy())
    }

    pub fn with_rng(cfg: AudioSection, scratch_dir: &Path, rng: StdRng) -> Self {
        Self {
            cfg,
            download_dir: scratch_dir.join("audio"),
            history: AssetHistory::default(),
            rng,
            downloaded: Vec::new(),
        }
    }

    async fn candidates(&self) -> Vec<TrackSource> {
        let mut local = Vec::new();
        if let Some(dir) = &self.cfg.directory {
            match scan_audio_dir(dir).await {
                Ok(found) => local = found,
                Err(e) => warn!("Cannot read audio directory {:?}: {:#}", dir, e),
            }
        }
        local.sort();

        local
            .into_iter()
            .map(TrackSource::Local)
            .chain(self.cfg.urls.iter().cloned().map(TrackSource::Remote))
            .collect()
    }

    async fn fetch(&mut self, url: &str) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .with_context(|| format!("failed to create {:?}", self.download_dir))?;

        let dest = self.download_dir.join(format!(
            "track-{:03}.{}",
            self.downloaded.len(),
            extension_of(url)
        ));
        self.downloaded.push(dest.clone());

        let timeout = Duration::from_secs(self.cfg.download_timeout_sec);
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout(timeout)
            .build();
        let target = dest.clone();
        let source = url.to_string();
        let bytes = tokio::task::spawn_blocking(move || -> anyhow::Result<u64> {
            let response = agent
                .get(&source)
                .call()
                .with_context(|| format!("GET {} failed", source))?;
            let mut reader = response.into_reader();
            let mut file = std::fs::File::create(&target)
                .with_context(|| format!("failed to create {:?}", target))?;
            let bytes = std::io::copy(&mut reader, &mut file)?;
            Ok(bytes)
        })
        .await
        .context("download task failed")??;

        debug!("Downloaded {} ({} bytes)", url, bytes);
        Ok(dest)
    }
}

impl AssetProvider for AudioLibrary {
    async fn prepare(&mut self, enabled: bool) -> AudioPlan {
        if !enabled {
            info!("Audio disabled, streaming silence");
            return AudioPlan::Disabled;
        }

        let candidates = self.candidates().await;
        if candidates.is_empty() {
            warn!("No audio sources available, streaming silence");
            return AudioPlan::Disabled;
        }

        let history = std::mem::take(&mut self.history);
        let (picked, history) = history.select(&candidates, self.cfg.max_tracks, &mut self.rng);
        self.history = history;

        let mut tracks = Vec::with_capacity(picked.len());
        for source in picked {
            match source {
                TrackSource::Local(path) => tracks.push(path),
                TrackSource::Remote(url) => match self.fetch(&url).await {
                    Ok(path) => tracks.push(path),
                    Err(e) => warn!("Skipping audio track {}: {:#}", url, e),
                },
            }
        }

        let plan = AudioPlan::from_tracks(tracks);
        if plan == AudioPlan::Disabled {
            warn!("All audio sources failed, streaming silence");
        } else {
            info!(
                "Audio plan ready with {} track(s), {} played this round",
                plan.sources().len(),
                self.history.played()
            );
        }
        plan
    }

    async fn cleanup(&mut self) {
        for path in self.downloaded.drain(..) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Removed downloaded track {:?}", path),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {:?}: {}", path, e),
            }
        }
        let _ = tokio::fs::remove_dir(&self.download_dir).await;
    }
}

async fn scan_audio_dir(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && is_audio(&path) {
            found.push(path);
        }
    }
    Ok(found)
}

fn is_audio(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| AUDIO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn extension_of(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((_, ext)) if AUDIO_EXTENSIONS.iter().any(|a| a.eq_ignore_ascii_case(ext)) => ext,
        _ => "mp3",
    }
}
