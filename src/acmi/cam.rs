//! # CAM（Custom Agent Metadata）スキーマ
//!
//! 強化学習メタデータを `Agent.*` 名前空間のフラットなキー/値として
//! ACMIに埋め込むためのエンコーダ・デコーダです。
//!
//! 標準ACMIビューアは未知のプロパティを無視するため、CAMキーは
//! 通常のACMI行に追加されるフィールドにすぎず、構造的な逸脱はありません。
//!
//! ## エンコード規則
//!
//! - スカラー値は固定キーに1対1で対応
//! - 行動ベクトルは `Agent.Action.<i>` に展開
//! - 報酬成分は `Agent.Reward.<成分名>` に展開
//! - 任意項目が `None` の場合はキー自体を出力しない（番兵値は使わない）
//! - 設定の配列は `json:` 接頭辞付きのJSONテキスト（`json:` で始まる文字列も同様）

use std::collections::BTreeMap;

use tracing::warn;

use crate::acmi::error::{AcmiWarning, Outcome, WarningKind};
use crate::acmi::property::{KeyKind, PropertyMap, PropertyValue};
use crate::models::common::{AngularVelocity, Velocity3D};
use crate::models::episode::{FlightDataPoint, FlightEpisode, RlMetrics, Telemetry};

/// CAMキー定義
pub mod keys {
    use crate::acmi::property::KeyKind;

    // 強化学習メトリクス
    pub const REWARD_INSTANT: &str = "Agent.Reward.Instant";
    pub const REWARD_CUM: &str = "Agent.Reward.Cum";
    pub const VALUE: &str = "Agent.Value";
    pub const LOG_PROB: &str = "Agent.LogProb";
    pub const ADVANTAGE: &str = "Agent.Advantage";
    pub const ENTROPY: &str = "Agent.Entropy";

    /// `Agent.Action.0`, `Agent.Action.1`, ...
    pub const ACTION_PREFIX: &str = "Agent.Action.";
    /// `Agent.Reward.<成分名>`
    pub const REWARD_PREFIX: &str = "Agent.Reward.";

    // 運動・テレメトリ拡張
    pub const STEP: &str = "Agent.Step";
    pub const VELOCITY_X: &str = "Agent.Velocity.X";
    pub const VELOCITY_Y: &str = "Agent.Velocity.Y";
    pub const VELOCITY_Z: &str = "Agent.Velocity.Z";
    pub const ANGULAR_VEL_P: &str = "Agent.AngularVel.P";
    pub const ANGULAR_VEL_Q: &str = "Agent.AngularVel.Q";
    pub const ANGULAR_VEL_R: &str = "Agent.AngularVel.R";
    pub const G_FORCE: &str = "Agent.GForce";
    pub const ALTITUDE: &str = "Agent.Altitude";
    pub const VERTICAL_SPEED: &str = "Agent.VerticalSpeed";
    pub const TURN_RATE: &str = "Agent.TurnRate";
    pub const BANK_ANGLE: &str = "Agent.BankAngle";
    pub const CONTROL_AILERON: &str = "Agent.Control.Aileron";
    pub const CONTROL_ELEVATOR: &str = "Agent.Control.Elevator";
    pub const CONTROL_RUDDER: &str = "Agent.Control.Rudder";

    // エピソードメタデータ（オブジェクトごとに1回）
    pub const AGENT_ID: &str = "Agent.AgentID";
    pub const EPISODE_ID: &str = "Agent.EpisodeID";
    pub const EPISODE_NUM: &str = "Agent.EpisodeNum";
    pub const START_TIME: &str = "Agent.StartTime";
    pub const TAGS: &str = "Agent.Tags";
    /// `Agent.Config.<パス>`
    pub const CONFIG_PREFIX: &str = "Agent.Config.";
    pub const SUCCESS: &str = "Agent.Success";
    pub const TERM_REASON: &str = "Agent.TermReason";
    pub const DURATION: &str = "Agent.Duration";
    pub const TOTAL_STEPS: &str = "Agent.TotalSteps";
    pub const TOTAL_REWARD: &str = "Agent.TotalReward";

    // ファイル・イベント
    pub const REF_POINT: &str = "Agent.RefPoint";
    pub const EVENT_SEVERITY: &str = "Agent.Event.Severity";
    pub const EVENT_TIME: &str = "Agent.Event.Time";
    pub const EVENT_META: &str = "Agent.Event.Meta";

    const NUMERIC: &[&str] = &[
        REWARD_INSTANT,
        REWARD_CUM,
        VALUE,
        LOG_PROB,
        ADVANTAGE,
        ENTROPY,
        STEP,
        VELOCITY_X,
        VELOCITY_Y,
        VELOCITY_Z,
        ANGULAR_VEL_P,
        ANGULAR_VEL_Q,
        ANGULAR_VEL_R,
        G_FORCE,
        ALTITUDE,
        VERTICAL_SPEED,
        TURN_RATE,
        BANK_ANGLE,
        CONTROL_AILERON,
        CONTROL_ELEVATOR,
        CONTROL_RUDDER,
        EPISODE_NUM,
        START_TIME,
        DURATION,
        TOTAL_STEPS,
        TOTAL_REWARD,
        EVENT_TIME,
    ];

    const TEXT: &[&str] = &[
        AGENT_ID,
        EPISODE_ID,
        TAGS,
        TERM_REASON,
        REF_POINT,
        EVENT_SEVERITY,
        EVENT_META,
    ];

    /// CAMキーの種別（CAMキーでなければ `None`）
    pub fn kind_of(key: &str) -> Option<KeyKind> {
        if !key.starts_with("Agent.") {
            return None;
        }
        if key == SUCCESS {
            Some(KeyKind::Flag)
        } else if NUMERIC.contains(&key)
            || key.starts_with(ACTION_PREFIX)
            || key.starts_with(REWARD_PREFIX)
        {
            Some(KeyKind::Numeric)
        } else if TEXT.contains(&key) {
            Some(KeyKind::Text)
        } else {
            // Agent.Config.* とその他の拡張キー
            Some(KeyKind::Inferred)
        }
    }
}

/// 行動欠番の補完値
pub const ACTION_GAP_SENTINEL: f64 = f64::NAN;

/// 受け付ける行動インデックスの上限（これを超えるキーは破棄）
pub const MAX_ACTION_INDEX: usize = 4095;

/// 設定値のJSONテキスト接頭辞
const JSON_TAG: &str = "json:";

fn number(props: &PropertyMap, key: &str) -> Option<f64> {
    props.get(key).and_then(PropertyValue::as_f64)
}

fn text(props: &PropertyMap, key: &str) -> Option<String> {
    props.get(key).map(PropertyValue::to_text)
}

// ---------------------------------------------------------------------------
// 強化学習メトリクス
// ---------------------------------------------------------------------------

/// RlMetrics → CAMプロパティ
pub fn encode_rl_metrics(metrics: &RlMetrics) -> PropertyMap {
    let mut props = PropertyMap::new();

    props.insert(keys::REWARD_INSTANT.into(), metrics.reward.into());
    props.insert(keys::REWARD_CUM.into(), metrics.cumulative_reward.into());

    for (i, value) in metrics.action.iter().enumerate() {
        props.insert(format!("{}{}", keys::ACTION_PREFIX, i), (*value).into());
    }

    let optional = [
        (keys::VALUE, metrics.value_estimate),
        (keys::LOG_PROB, metrics.policy_logprob),
        (keys::ADVANTAGE, metrics.advantage),
        (keys::ENTROPY, metrics.entropy),
    ];
    for (key, value) in optional {
        if let Some(v) = value {
            props.insert(key.into(), v.into());
        }
    }

    if let Some(components) = &metrics.reward_components {
        for (name, value) in components {
            let key = format!("{}{}", keys::REWARD_PREFIX, name);
            if key == keys::REWARD_INSTANT || key == keys::REWARD_CUM {
                warn!(
                    component = %name,
                    "CAM_ENCODE: 固定キーと衝突する報酬成分名をスキップしました"
                );
                continue;
            }
            props.insert(key, (*value).into());
        }
    }

    props
}

/// CAMプロパティ → RlMetrics
///
/// 存在しないキーは既定値のまま残ります。行動インデックスに欠番がある場合は
/// `ACTION_GAP_SENTINEL` で補完し、警告を返します。`MAX_ACTION_INDEX` を
/// 超えるインデックスは不正な値として警告し、破棄します。
pub fn decode_rl_metrics(props: &PropertyMap) -> Outcome<RlMetrics> {
    let mut warnings = Vec::new();
    let mut metrics = RlMetrics {
        reward: number(props, keys::REWARD_INSTANT).unwrap_or(0.0),
        cumulative_reward: number(props, keys::REWARD_CUM).unwrap_or(0.0),
        value_estimate: number(props, keys::VALUE),
        policy_logprob: number(props, keys::LOG_PROB),
        advantage: number(props, keys::ADVANTAGE),
        entropy: number(props, keys::ENTROPY),
        ..RlMetrics::default()
    };

    let mut indexed: BTreeMap<usize, f64> = BTreeMap::new();
    let mut components: BTreeMap<String, f64> = BTreeMap::new();

    for (key, value) in props {
        if let Some(index) = key.strip_prefix(keys::ACTION_PREFIX) {
            match (index.parse::<usize>(), value.as_f64()) {
                (Ok(i), Some(v)) if i <= MAX_ACTION_INDEX => {
                    indexed.insert(i, v);
                }
                _ => warnings.push(AcmiWarning::new(WarningKind::MalformedValue {
                    key: key.clone(),
                    raw: value.to_text(),
                })),
            }
        } else if let Some(name) = key.strip_prefix(keys::REWARD_PREFIX) {
            if key == keys::REWARD_INSTANT || key == keys::REWARD_CUM {
                continue;
            }
            if let Some(v) = value.as_f64() {
                components.insert(name.to_string(), v);
            }
        }
    }

    if let Some(&max_index) = indexed.keys().next_back() {
        let mut missing = Vec::new();
        metrics.action = (0..=max_index)
            .map(|i| match indexed.get(&i) {
                Some(v) => *v,
                None => {
                    missing.push(i);
                    ACTION_GAP_SENTINEL
                }
            })
            .collect();
        if !missing.is_empty() {
            warnings.push(AcmiWarning::new(WarningKind::ActionIndexGap { missing }));
        }
    }

    if !components.is_empty() {
        metrics.reward_components = Some(components);
    }

    Outcome::new(metrics, warnings)
}

// ---------------------------------------------------------------------------
// 運動・テレメトリ拡張
// ---------------------------------------------------------------------------

/// 標準ACMIキーで表現できない運動・テレメトリ値をCAMプロパティへ
pub fn encode_kinematics(point: &FlightDataPoint) -> PropertyMap {
    let mut props = PropertyMap::new();
    let t = &point.telemetry;

    props.insert(keys::STEP.into(), PropertyValue::Integer(point.step as i64));
    props.insert(keys::VELOCITY_X.into(), point.velocity.x.into());
    props.insert(keys::VELOCITY_Y.into(), point.velocity.y.into());
    props.insert(keys::VELOCITY_Z.into(), point.velocity.z.into());

    if let Some(w) = &point.angular_velocity {
        props.insert(keys::ANGULAR_VEL_P.into(), w.p.into());
        props.insert(keys::ANGULAR_VEL_Q.into(), w.q.into());
        props.insert(keys::ANGULAR_VEL_R.into(), w.r.into());
    }

    props.insert(keys::G_FORCE.into(), t.g_force.into());
    props.insert(keys::ALTITUDE.into(), t.altitude.into());
    props.insert(keys::VERTICAL_SPEED.into(), t.vertical_speed.into());
    props.insert(keys::TURN_RATE.into(), t.turn_rate.into());
    props.insert(keys::BANK_ANGLE.into(), t.bank_angle.into());

    let controls = [
        (keys::CONTROL_AILERON, t.aileron),
        (keys::CONTROL_ELEVATOR, t.elevator),
        (keys::CONTROL_RUDDER, t.rudder),
    ];
    for (key, value) in controls {
        if let Some(v) = value {
            props.insert(key.into(), v.into());
        }
    }

    props
}

/// CAM速度（3成分すべてある場合のみ）
pub fn decode_velocity(props: &PropertyMap) -> Option<Velocity3D> {
    Some(Velocity3D::new(
        number(props, keys::VELOCITY_X)?,
        number(props, keys::VELOCITY_Y)?,
        number(props, keys::VELOCITY_Z)?,
    ))
}

/// CAM角速度（3成分すべてある場合のみ）
pub fn decode_angular_velocity(props: &PropertyMap) -> Option<AngularVelocity> {
    Some(AngularVelocity::new(
        number(props, keys::ANGULAR_VEL_P)?,
        number(props, keys::ANGULAR_VEL_Q)?,
        number(props, keys::ANGULAR_VEL_R)?,
    ))
}

pub fn decode_step(props: &PropertyMap) -> Option<u64> {
    number(props, keys::STEP).map(|v| v.max(0.0) as u64)
}

/// CAMテレメトリ拡張を `telemetry` に上書き適用
///
/// キーがない項目は呼び出し側で設定済みの代替値のままです。
pub fn apply_telemetry_extensions(props: &PropertyMap, telemetry: &mut Telemetry) {
    let scalars: [(&str, &mut f64); 5] = [
        (keys::G_FORCE, &mut telemetry.g_force),
        (keys::ALTITUDE, &mut telemetry.altitude),
        (keys::VERTICAL_SPEED, &mut telemetry.vertical_speed),
        (keys::TURN_RATE, &mut telemetry.turn_rate),
        (keys::BANK_ANGLE, &mut telemetry.bank_angle),
    ];
    for (key, slot) in scalars {
        if let Some(v) = number(props, key) {
            *slot = v;
        }
    }

    telemetry.aileron = number(props, keys::CONTROL_AILERON);
    telemetry.elevator = number(props, keys::CONTROL_ELEVATOR);
    telemetry.rudder = number(props, keys::CONTROL_RUDDER);
}

// ---------------------------------------------------------------------------
// エピソードメタデータ
// ---------------------------------------------------------------------------

/// 最初のフレームに付与するエピソードメタデータ
pub fn encode_episode_start(episode: &FlightEpisode) -> PropertyMap {
    let mut props = PropertyMap::new();

    props.insert(keys::AGENT_ID.into(), episode.agent_id.as_str().into());
    props.insert(keys::EPISODE_ID.into(), episode.episode_id.as_str().into());
    props.insert(keys::EPISODE_NUM.into(), PropertyValue::Integer(episode.episode_number as i64));
    props.insert(keys::START_TIME.into(), episode.start_time.into());

    if let Some(tags) = &episode.tags {
        props.insert(keys::TAGS.into(), tags.join(",").into());
    }

    if let Some(config) = &episode.config {
        for (key, value) in config {
            flatten_config(&format!("{}{}", keys::CONFIG_PREFIX, key), value, &mut props);
        }
    }

    props
}

fn flatten_config(key: &str, value: &serde_json::Value, props: &mut PropertyMap) {
    match value {
        serde_json::Value::Object(map) => {
            for (child, child_value) in map {
                flatten_config(&format!("{}.{}", key, child), child_value, props);
            }
        }
        serde_json::Value::Bool(b) => {
            props.insert(key.to_string(), PropertyValue::Bool(*b));
        }
        serde_json::Value::Number(n) => {
            let value = match n.as_i64() {
                Some(i) => PropertyValue::Integer(i),
                None => PropertyValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            };
            props.insert(key.to_string(), value);
        }
        serde_json::Value::String(s) if !s.starts_with(JSON_TAG) => {
            props.insert(key.to_string(), PropertyValue::Text(s.clone()));
        }
        serde_json::Value::String(_) | serde_json::Value::Array(_) => {
            props.insert(key.to_string(), PropertyValue::Text(format!("{}{}", JSON_TAG, value)));
        }
        // null は「値なし」と区別できないため出力しない
        serde_json::Value::Null => {}
    }
}

/// 最終フレームに付与する終了メタデータ
pub fn encode_episode_end(episode: &FlightEpisode) -> PropertyMap {
    let mut props = PropertyMap::new();
    props.insert(keys::SUCCESS.into(), episode.success.into());
    props.insert(keys::TERM_REASON.into(), episode.termination_reason.as_str().into());
    props.insert(keys::DURATION.into(), episode.duration.into());
    props.insert(keys::TOTAL_STEPS.into(), PropertyValue::Integer(episode.total_steps as i64));
    props.insert(keys::TOTAL_REWARD.into(), episode.total_reward.into());
    props
}

/// 復元されたエピソードメタデータ（存在するキーのみ `Some`）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpisodeMetadata {
    pub agent_id: Option<String>,
    pub episode_id: Option<String>,
    pub episode_number: Option<u64>,
    pub start_time: Option<f64>,
    pub tags: Option<Vec<String>>,
    pub config: Option<BTreeMap<String, serde_json::Value>>,
    pub success: Option<bool>,
    pub termination_reason: Option<String>,
    pub duration: Option<f64>,
    pub total_steps: Option<u64>,
    pub total_reward: Option<f64>,
}

impl EpisodeMetadata {
    /// CAMキーを1つでも含むかどうか
    pub fn is_empty(&self) -> bool {
        *self == EpisodeMetadata::default()
    }
}

/// CAMプロパティ → エピソードメタデータ
pub fn decode_episode_metadata(props: &PropertyMap) -> EpisodeMetadata {
    let mut config = serde_json::Map::new();
    for (key, value) in props {
        if let Some(path) = key.strip_prefix(keys::CONFIG_PREFIX) {
            insert_config_path(&mut config, path, config_value(value));
        }
    }

    EpisodeMetadata {
        agent_id: text(props, keys::AGENT_ID),
        episode_id: text(props, keys::EPISODE_ID),
        episode_number: number(props, keys::EPISODE_NUM).map(|v| v.max(0.0) as u64),
        start_time: number(props, keys::START_TIME),
        tags: text(props, keys::TAGS).map(|joined| split_tags(&joined)),
        config: if config.is_empty() { None } else { Some(config.into_iter().collect()) },
        success: props.get(keys::SUCCESS).and_then(PropertyValue::as_bool),
        termination_reason: text(props, keys::TERM_REASON),
        duration: number(props, keys::DURATION),
        total_steps: number(props, keys::TOTAL_STEPS).map(|v| v.max(0.0) as u64),
        total_reward: number(props, keys::TOTAL_REWARD),
    }
}

fn split_tags(joined: &str) -> Vec<String> {
    if joined.is_empty() {
        return Vec::new();
    }
    joined.split(',').map(|tag| tag.trim().to_string()).collect()
}

/// `json:` 接頭辞付きのテキストはJSONとして復元（解釈できなければ文字列のまま）
fn config_value(value: &PropertyValue) -> serde_json::Value {
    if let PropertyValue::Text(s) = value {
        if let Some(json) = s.strip_prefix(JSON_TAG) {
            if let Ok(decoded) = serde_json::from_str(json) {
                return decoded;
            }
        }
    }
    value.to_json()
}

fn insert_config_path(
    root: &mut serde_json::Map<String, serde_json::Value>,
    path: &str,
    value: serde_json::Value,
) {
    match path.split_once('.') {
        None => {
            root.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = root
                .entry(head.to_string())
                .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
            if !child.is_object() {
                *child = serde_json::Value::Object(serde_json::Map::new());
            }
            if let serde_json::Value::Object(map) = child {
                insert_config_path(map, rest, value);
            }
        }
    }
}

/// `KeyKind` を再公開（スキーマ判定用）
pub fn kind_of(key: &str) -> Option<KeyKind> {
    keys::kind_of(key)
}
