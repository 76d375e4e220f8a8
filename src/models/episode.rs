use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::common::{AngularVelocity, Orientation, Position3D, Velocity3D};

/// 飛行テレメトリ
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Telemetry {
    /// 対気速度（m/s）
    pub airspeed: f64,
    /// 高度（m）
    pub altitude: f64,
    /// 荷重倍数（G）
    pub g_force: f64,
    /// スロットル位置 [0, 1]
    pub throttle: f64,
    /// 迎角（度）
    pub aoa: f64,
    /// 横滑り角（度）
    pub aos: f64,
    /// 機首方位（度）
    pub heading: f64,
    /// 昇降率（m/s）
    pub vertical_speed: f64,
    /// 旋回率（deg/s）
    pub turn_rate: f64,
    /// バンク角（度）
    pub bank_angle: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aileron: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevator: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rudder: Option<f64>,
}

/// 強化学習メトリクス
///
/// 任意項目は `None` で「値なし」を表し、0.0 とは区別されます。
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RlMetrics {
    /// ステップ報酬
    pub reward: f64,
    /// エピソード累積報酬
    pub cumulative_reward: f64,
    /// 行動ベクトル
    #[serde(default)]
    pub action: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_logprob: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_estimate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advantage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entropy: Option<f64>,
    /// 多目的報酬の成分（名前 → 値）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward_components: Option<BTreeMap<String, f64>>,
}

/// 離散イベント（墜落、終了など）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightEvent {
    pub timestamp: f64,
    /// "crash", "checkpoint", "timeout", "custom" など
    pub event_type: String,
    /// "info", "warning", "error"
    pub severity: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}

/// 1エージェント・1ステップ分の飛行データ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightDataPoint {
    /// シミュレーション時刻（秒）
    pub timestamp: f64,
    /// エピソード内ステップ番号
    pub step: u64,
    pub position: Position3D,
    pub orientation: Orientation,
    pub velocity: Velocity3D,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub angular_velocity: Option<AngularVelocity>,
    pub telemetry: Telemetry,
    #[serde(default)]
    pub rl_metrics: RlMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<FlightEvent>>,
}

/// 1エージェントの完全な飛行エピソード
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightEpisode {
    pub episode_id: String,
    pub agent_id: String,
    pub episode_number: u64,

    /// 開始時刻（Unix秒）
    pub start_time: f64,
    /// エピソード長（秒）
    pub duration: f64,
    pub total_steps: u64,

    pub total_reward: f64,
    pub success: bool,
    /// "success", "crash", "timeout", "other" など
    pub termination_reason: String,

    #[serde(default)]
    pub trajectory: Vec<FlightDataPoint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl FlightEpisode {
    /// 軌跡の時刻が単調非減少であることを確認
    ///
    /// # 戻り値
    ///
    /// 違反がある場合は最初に逆行したインデックス
    pub fn first_time_regression(&self) -> Option<usize> {
        self.trajectory
            .windows(2)
            .position(|pair| pair[1].timestamp < pair[0].timestamp)
            .map(|i| i + 1)
    }

    /// 軌跡の整合性を検証
    pub fn validate(&self) -> Result<(), String> {
        match self.first_time_regression() {
            Some(index) => Err(format!(
                "エピソード {} の時刻が逆行しています (index {}: {} -> {})",
                self.episode_id,
                index,
                self.trajectory[index - 1].timestamp,
                self.trajectory[index].timestamp
            )),
            None => Ok(()),
        }
    }
}
