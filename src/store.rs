//! # エピソードストア
//!
//! `IEpisodeStore` のJSON Lines実装です。
//!
//! ```text
//! <root>/
//!   <run>/
//!     episodes.jsonl   # 1行 = 1エピソード（serde_json）
//! ```
//!
//! 同じ `episode_id` が複数回追記された場合は最後のものが有効です。

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::models::episode::FlightEpisode;
use crate::models::traits::IEpisodeStore;

const EPISODES_FILE: &str = "episodes.jsonl";

/// ストアエラー
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ストア入出力エラー {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("エピソードのシリアライズに失敗 {path}:{line}: {source}")]
    Serialize {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("見つかりません: {0}")]
    NotFound(String),
}

/// 一覧表示用のエピソード概要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSummary {
    pub episode_id: String,
    pub agent_id: String,
    pub episode_number: u64,
    pub total_steps: u64,
    pub total_reward: f64,
    pub success: bool,
}

impl From<&FlightEpisode> for EpisodeSummary {
    fn from(episode: &FlightEpisode) -> Self {
        Self {
            episode_id: episode.episode_id.clone(),
            agent_id: episode.agent_id.clone(),
            episode_number: episode.episode_number,
            total_steps: episode.total_steps,
            total_reward: episode.total_reward,
            success: episode.success,
        }
    }
}

/// JSON Lines形式のエピソードストア
#[derive(Debug, Clone)]
pub struct JsonlEpisodeStore {
    root: PathBuf,
}

impl JsonlEpisodeStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_file(&self, run: &str) -> PathBuf {
        self.root.join(run).join(EPISODES_FILE)
    }

    /// ラン内の全エピソードを読み込み（後勝ちで重複を除去）
    pub fn load_all(&self, run: &str) -> Result<Vec<FlightEpisode>, StoreError> {
        let path = self.run_file(run);
        if !path.exists() {
            return Err(StoreError::NotFound(format!("run '{}'", run)));
        }

        let io_err = |source: std::io::Error| StoreError::Io { path: path.clone(), source };
        let reader = BufReader::new(File::open(&path).map_err(io_err)?);

        let mut episodes: Vec<FlightEpisode> = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line.map_err(io_err)?;
            if line.trim().is_empty() {
                continue;
            }
            let episode: FlightEpisode =
                serde_json::from_str(&line).map_err(|source| StoreError::Serialize {
                    path: path.clone(),
                    line: index + 1,
                    source,
                })?;
            episodes.retain(|e| e.episode_id != episode.episode_id);
            episodes.push(episode);
        }

        debug!(run = %run, episodes = episodes.len(), "STORE_LOAD: ランを読み込みました");
        Ok(episodes)
    }
}

impl IEpisodeStore for JsonlEpisodeStore {
    fn append(&mut self, run: &str, episode: &FlightEpisode) -> Result<(), StoreError> {
        let path = self.run_file(run);
        let io_err = |source: std::io::Error| StoreError::Io { path: path.clone(), source };

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(io_err)?;
        }

        let json = serde_json::to_string(episode).map_err(|source| StoreError::Serialize {
            path: path.clone(),
            line: 0,
            source,
        })?;

        let file = OpenOptions::new().create(true).append(true).open(&path).map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", json).map_err(io_err)?;
        writer.flush().map_err(io_err)?;

        info!(
            run = %run,
            episode_id = %episode.episode_id,
            agent_id = %episode.agent_id,
            steps = episode.trajectory.len(),
            "STORE_APPEND: エピソードを保存しました"
        );
        Ok(())
    }

    fn load(&self, run: &str, episode_id: &str) -> Result<Option<FlightEpisode>, StoreError> {
        Ok(self.load_all(run)?.into_iter().find(|e| e.episode_id == episode_id))
    }

    fn list(&self, run: &str) -> Result<Vec<EpisodeSummary>, StoreError> {
        Ok(self.load_all(run)?.iter().map(EpisodeSummary::from).collect())
    }

    fn runs(&self) -> Result<Vec<String>, StoreError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let io_err = |source: std::io::Error| StoreError::Io { path: self.root.clone(), source };

        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            if entry.path().join(EPISODES_FILE).is_file() {
                runs.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        runs.sort();
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::common::{Orientation, Position3D, Velocity3D};
    use crate::models::episode::{FlightDataPoint, RlMetrics, Telemetry};

    fn episode(id: &str, reward: f64) -> FlightEpisode {
        FlightEpisode {
            episode_id: id.to_string(),
            agent_id: "agent_01".to_string(),
            episode_number: 3,
            start_time: 0.0,
            duration: 0.1,
            total_steps: 1,
            total_reward: reward,
            success: true,
            termination_reason: "completed".to_string(),
            trajectory: vec![FlightDataPoint {
                timestamp: 0.0,
                step: 0,
                position: Position3D::new(1.0, 2.0, 3.0),
                orientation: Orientation::default(),
                velocity: Velocity3D::default(),
                angular_velocity: None,
                telemetry: Telemetry::default(),
                rl_metrics: RlMetrics { action: vec![0.5], ..RlMetrics::default() },
                events: None,
            }],
            config: None,
            tags: Some(vec!["store".to_string()]),
        }
    }

    #[test]
    fn test_append_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonlEpisodeStore::new(dir.path());

        store.append("run_a", &episode("ep_1", 1.0)).unwrap();
        store.append("run_a", &episode("ep_2", 2.0)).unwrap();

        let loaded = store.load("run_a", "ep_2").unwrap().unwrap();
        assert_eq!(loaded, episode("ep_2", 2.0));
        assert!(store.load("run_a", "ep_9").unwrap().is_none());

        let list = store.list("run_a").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].episode_id, "ep_1");
    }

    #[test]
    fn test_last_append_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonlEpisodeStore::new(dir.path());
        store.append("run", &episode("ep", 1.0)).unwrap();
        store.append("run", &episode("ep", 5.0)).unwrap();

        let list = store.list("run").unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].total_reward, 5.0);
    }

    #[test]
    fn test_runs_and_missing_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonlEpisodeStore::new(dir.path().join("store"));
        assert!(store.runs().unwrap().is_empty());

        store.append("b", &episode("ep", 1.0)).unwrap();
        store.append("a", &episode("ep", 1.0)).unwrap();
        assert_eq!(store.runs().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert!(matches!(store.list("zzz"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_corrupt_line_reports_position() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonlEpisodeStore::new(dir.path());
        store.append("run", &episode("ep", 1.0)).unwrap();

        let path = dir.path().join("run").join(EPISODES_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{not json").unwrap();

        assert!(matches!(store.load_all("run"), Err(StoreError::Serialize { line: 2, .. })));
    }
}
