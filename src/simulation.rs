//! # Simulation モジュール
//!
//! デモ・テスト用の合成飛行エピソードを生成する固定時間刻みエンジンを提供します。
//!
//! 複数のエージェントを直線または旋回パターンで飛行させ、速度から姿勢を、
//! 姿勢と旋回半径からテレメトリを計算し、合成の強化学習メトリクスを付与します。
//! 生成したエピソードはACMI書き出しの動作確認やラウンドトリップ検証に使います。
//!
//! ## 主要機能
//!
//! - **シミュレーションループ管理**: 固定時間刻み（Δt）による時間進行制御
//! - **飛行パターン**: `straight`（北向き直線）/ `circular`（左旋回）
//! - **合成メトリクス**: 報酬・累積報酬・価値推定・行動ベクトル・報酬成分
//! - **イベント**: 中間地点のチェックポイント、失敗エージェントの墜落
//!
//! ## 使用例
//!
//! ```rust
//! use acmi_bridge::config::DemoConfig;
//! use acmi_bridge::simulation::DemoEngine;
//!
//! let mut engine = DemoEngine::new(&DemoConfig::default(), 1_700_000_000.0);
//! engine.initialize();
//! let episodes = engine.run();
//! assert_eq!(episodes.len(), 2);
//! ```

use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::config::DemoConfig;
use crate::models::common::{math_utils, AngularVelocity, Orientation, Position3D, Velocity3D};
use crate::models::episode::{FlightDataPoint, FlightEpisode, FlightEvent, RlMetrics, Telemetry};

/// 重力加速度（m/s²）
const GRAVITY: f64 = 9.81;
/// 巡航速度（m/s）
const CRUISE_SPEED: f64 = 20.0;
/// 旋回半径（m）
const TURN_RADIUS: f64 = 100.0;
/// 基本高度（m）
const BASE_ALTITUDE: f64 = 1_500.0;
/// 直線飛行時のエージェント間隔（m）
const LANE_SPACING: f64 = 200.0;

/// 飛行パターン
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlightPattern {
    Straight,
    Circular,
}

impl FromStr for FlightPattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "straight" => Ok(FlightPattern::Straight),
            "circular" => Ok(FlightPattern::Circular),
            _ => Err(format!("無効な飛行パターン: {}. 利用可能: straight, circular", s)),
        }
    }
}

impl FlightPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlightPattern::Straight => "straight",
            FlightPattern::Circular => "circular",
        }
    }
}

/// 生成中のエージェント
#[derive(Debug, Clone)]
pub struct DemoAgent {
    pub agent_id: String,
    pub index: usize,
    /// 最終ステップで墜落させるか
    pub fails: bool,
    pub cumulative_reward: f64,
    pub trajectory: Vec<FlightDataPoint>,
}

/// デモ軌跡生成エンジン
pub struct DemoEngine {
    pub current_time: f64,
    pub dt: f64,
    pub max_time: f64,
    pub seed: u64,
    pub step_count: u64,
    pub total_steps: u64,

    pub pattern: FlightPattern,
    pub agents: Vec<DemoAgent>,

    /// エピソード開始時刻（Unix秒）
    start_time: f64,
    agent_count: usize,
}

impl DemoEngine {
    pub fn new(config: &DemoConfig, start_time: f64) -> Self {
        Self {
            current_time: 0.0,
            dt: config.dt_s,
            max_time: config.t_max_s,
            seed: config.seed,
            step_count: 0,
            total_steps: (config.t_max_s / config.dt_s).floor().max(1.0) as u64,
            pattern: config.pattern,
            agents: Vec::new(),
            start_time,
            agent_count: config.agents,
        }
    }

    /// エージェントを初期化
    pub fn initialize(&mut self) {
        info!("デモ生成エンジンを初期化中...");

        self.agents = (0..self.agent_count)
            .map(|index| DemoAgent {
                agent_id: format!("agent_{:02}", index + 1),
                index,
                fails: index % 2 == 1,
                cumulative_reward: 0.0,
                trajectory: Vec::with_capacity(self.total_steps as usize),
            })
            .collect();

        for agent in &self.agents {
            debug!("エージェント初期化: {} (失敗: {})", agent.agent_id, agent.fails);
        }
        info!(
            "初期化完了: {}機, パターン: {}, ステップ数: {}",
            self.agents.len(),
            self.pattern.as_str(),
            self.total_steps
        );
    }

    /// 生成ループを実行してエピソードを返す
    pub fn run(&mut self) -> Vec<FlightEpisode> {
        info!("=== デモ生成開始 ===");

        let report_interval = (self.total_steps / 10).max(1);
        while self.step_count < self.total_steps {
            self.step();

            if self.step_count % report_interval == 0 {
                let progress = self.step_count as f64 / self.total_steps as f64 * 100.0;
                let (done, total) = (self.step_count, self.total_steps);
                debug!("進行状況: {:.1}% ({}/{}ステップ)", progress, done, total);
            }
        }

        info!("=== デモ生成完了 ===");
        info!("総ステップ数: {}", self.step_count);
        self.episodes()
    }

    /// 1ステップ進める
    pub fn step(&mut self) {
        let step = self.step_count;
        let t = self.current_time;
        let last = step + 1 == self.total_steps;
        let checkpoint = step == self.total_steps / 2;
        let pattern = self.pattern;
        let phase_base = self.seed as f64 * 0.1;
        let count = self.agents.len().max(1);

        for agent in &mut self.agents {
            let phase = phase_base + 2.0 * PI * agent.index as f64 / count as f64;
            let mut point = sample(pattern, agent.index, phase, step, t);

            agent.cumulative_reward += point.rl_metrics.reward;
            point.rl_metrics.cumulative_reward = agent.cumulative_reward;

            let mut events = Vec::new();
            if checkpoint {
                events.push(FlightEvent {
                    timestamp: t,
                    event_type: "checkpoint".to_string(),
                    severity: "info".to_string(),
                    message: "halfway point reached".to_string(),
                    metadata: None,
                });
            }
            if last && agent.fails {
                events.push(FlightEvent {
                    timestamp: t,
                    event_type: "crash".to_string(),
                    severity: "error".to_string(),
                    message: "lost control, ground impact".to_string(),
                    metadata: Some(BTreeMap::from([
                        ("altitude".to_string(), json!(point.position.z)),
                        ("airspeed".to_string(), json!(point.telemetry.airspeed)),
                    ])),
                });
            }
            if !events.is_empty() {
                point.events = Some(events);
            }

            agent.trajectory.push(point);
        }

        self.step_count += 1;
        self.current_time = self.step_count as f64 * self.dt;
    }

    /// 現在までの軌跡からエピソードを構築
    pub fn episodes(&self) -> Vec<FlightEpisode> {
        self.agents
            .iter()
            .map(|agent| {
                let duration = match (agent.trajectory.first(), agent.trajectory.last()) {
                    (Some(first), Some(last)) => last.timestamp - first.timestamp,
                    _ => 0.0,
                };
                FlightEpisode {
                    episode_id: format!("demo_{}_{}", self.seed, agent.agent_id),
                    agent_id: agent.agent_id.clone(),
                    episode_number: self.seed,
                    start_time: self.start_time,
                    duration,
                    total_steps: agent.trajectory.len() as u64,
                    total_reward: agent.cumulative_reward,
                    success: !agent.fails,
                    termination_reason: if agent.fails { "crash" } else { "completed" }.to_string(),
                    trajectory: agent.trajectory.clone(),
                    config: Some(BTreeMap::from([
                        ("pattern".to_string(), json!(self.pattern.as_str())),
                        ("dt".to_string(), json!(self.dt)),
                        ("seed".to_string(), json!(self.seed)),
                    ])),
                    tags: Some(vec!["demo".to_string(), self.pattern.as_str().to_string()]),
                }
            })
            .collect()
    }
}

/// 時刻 `t` での1エージェント分のデータ点
fn sample(pattern: FlightPattern, index: usize, phase: f64, step: u64, t: f64) -> FlightDataPoint {
    let altitude_base = BASE_ALTITUDE + 100.0 * index as f64;

    let (position, velocity, roll, turn_rate_rad) = match pattern {
        FlightPattern::Straight => (
            Position3D::new(LANE_SPACING * index as f64, CRUISE_SPEED * t, altitude_base),
            Velocity3D::new(0.0, CRUISE_SPEED, 0.0),
            0.0,
            0.0,
        ),
        FlightPattern::Circular => {
            let omega = CRUISE_SPEED / TURN_RADIUS;
            let angle = omega * t + phase;
            // 反時計回りの旋回は左バンク（負）
            let bank = -math_utils::rad_to_deg((CRUISE_SPEED * omega / GRAVITY).atan());
            (
                Position3D::new(
                    TURN_RADIUS * angle.cos(),
                    TURN_RADIUS * angle.sin(),
                    altitude_base + 5.0 * (2.0 * angle).sin(),
                ),
                Velocity3D::new(
                    -CRUISE_SPEED * angle.sin(),
                    CRUISE_SPEED * angle.cos(),
                    10.0 * omega * (2.0 * angle).cos(),
                ),
                bank + 2.0 * t.sin(),
                omega,
            )
        }
    };

    let orientation = Orientation::from_velocity(&velocity, roll);
    let elevator = orientation.pitch / 20.0;
    let aileron = roll / 30.0;
    let rudder = 0.05 * t.sin();
    let throttle = 0.7 + 0.1 * t.sin();

    let telemetry = Telemetry {
        airspeed: velocity.magnitude(),
        altitude: position.z,
        g_force: 1.0 / math_utils::deg_to_rad(roll).cos().abs().max(0.1),
        throttle,
        aoa: 5.0 + 2.0 * t.sin(),
        aos: 0.0,
        heading: orientation.yaw,
        vertical_speed: velocity.z,
        // 反時計回りなので機首方位は減少
        turn_rate: -math_utils::rad_to_deg(turn_rate_rad),
        bank_angle: roll,
        aileron: Some(aileron),
        elevator: Some(elevator),
        rudder: Some(rudder),
    };

    let reward = 1.0 + 0.5 * t.sin();
    let rl_metrics = RlMetrics {
        reward,
        cumulative_reward: 0.0,
        action: vec![aileron, elevator, rudder, throttle],
        policy_logprob: Some(-1.0 - 0.1 * t.cos()),
        value_estimate: Some(50.0 + 10.0 * t.sin()),
        advantage: Some(0.1 * (2.0 * t).sin()),
        entropy: Some(0.5),
        reward_components: Some(BTreeMap::from([
            ("altitude".to_string(), 0.5 + 0.1 * t.sin()),
            ("speed".to_string(), 0.3 + 0.1 * t.cos()),
            ("heading".to_string(), 0.2),
        ])),
    };

    FlightDataPoint {
        timestamp: t,
        step,
        position,
        orientation,
        velocity,
        angular_velocity: Some(AngularVelocity::new(0.1 * t.sin(), 0.1 * t.cos(), turn_rate_rad)),
        telemetry,
        rl_metrics,
        events: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pattern: FlightPattern, agents: usize) -> DemoConfig {
        DemoConfig {
            dt_s: 0.1,
            t_max_s: 2.0,
            agents,
            pattern,
            seed: 7,
        }
    }

    #[test]
    fn test_engine_produces_episode_per_agent() {
        let mut engine = DemoEngine::new(&config(FlightPattern::Circular, 3), 1_700_000_000.0);
        engine.initialize();
        let episodes = engine.run();

        assert_eq!(episodes.len(), 3);
        assert_eq!(engine.step_count, 20);
        for episode in &episodes {
            assert_eq!(episode.trajectory.len(), 20);
            assert_eq!(episode.total_steps, 20);
            assert!(episode.first_time_regression().is_none());
            let last = episode.trajectory.last().unwrap();
            assert!((episode.total_reward - last.rl_metrics.cumulative_reward).abs() < 1e-12);
        }
        assert_eq!(episodes[0].agent_id, "agent_01");
        assert_eq!(episodes[0].start_time, 1_700_000_000.0);
    }

    #[test]
    fn test_failing_agent_crashes_on_last_step() {
        let mut engine = DemoEngine::new(&config(FlightPattern::Straight, 2), 0.0);
        engine.initialize();
        let episodes = engine.run();

        assert!(episodes[0].success);
        assert_eq!(episodes[0].termination_reason, "completed");
        assert!(!episodes[1].success);
        assert_eq!(episodes[1].termination_reason, "crash");

        let last_events = episodes[1].trajectory.last().unwrap().events.as_ref().unwrap();
        assert_eq!(last_events[0].event_type, "crash");
        assert!(episodes[0].trajectory.last().unwrap().events.is_none());

        // 中間地点のチェックポイントは全員に付与
        assert_eq!(episodes[0].trajectory[10].events.as_ref().unwrap()[0].event_type, "checkpoint");
    }

    #[test]
    fn test_straight_pattern_heads_north() {
        let mut engine = DemoEngine::new(&config(FlightPattern::Straight, 1), 0.0);
        engine.initialize();
        let episodes = engine.run();
        let point = &episodes[0].trajectory[5];

        assert!((point.orientation.yaw - 0.0).abs() < 1e-9);
        assert!((point.position.y - CRUISE_SPEED * 0.5).abs() < 1e-9);
        assert_eq!(point.telemetry.airspeed, CRUISE_SPEED);
    }

    #[test]
    fn test_circular_pattern_stays_on_radius() {
        let mut engine = DemoEngine::new(&config(FlightPattern::Circular, 1), 0.0);
        engine.initialize();
        for point in &engine.run()[0].trajectory {
            let r = (point.position.x.powi(2) + point.position.y.powi(2)).sqrt();
            assert!((r - TURN_RADIUS).abs() < 1e-9);
            assert!(point.telemetry.bank_angle < 0.0);
        }
    }

    #[test]
    fn test_pattern_from_str() {
        assert_eq!("Circular".parse::<FlightPattern>(), Ok(FlightPattern::Circular));
        assert!("loop".parse::<FlightPattern>().is_err());
    }
}
