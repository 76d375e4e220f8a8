//! # ACMI ライター
//!
//! `FlightEpisode` 群をACMIテキストに書き出します。
//!
//! ## 主要機能
//!
//! - 全エピソードのデータ点を時刻順にマージし、フレーム（`#t`）単位で出力
//! - 最初のフレームに静的プロパティとエピソード開始メタデータ
//! - 最後のフレームに終了メタデータとオブジェクト削除（`-id`）
//! - 前フレームにあって今回ないキーは空値（`Key=`）で消去
//! - 全量（Full）/ 差分（Delta）の2種類の更新形式

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::acmi::cam::{self, keys};
use crate::acmi::error::AcmiError;
use crate::acmi::geo::{self, GeoPoint, EDWARDS_AFB};
use crate::acmi::property::{escape_text, format_number, format_value, standard, PropertyValue};
use crate::models::episode::{FlightDataPoint, FlightEpisode, FlightEvent};

/// オブジェクト更新の出力形式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateEncoding {
    /// 毎フレームすべてのキーを出力
    #[default]
    Full,
    /// 変化したキーのみ出力し、`T=` の不変サブフィールドは空にする
    Delta,
}

impl std::str::FromStr for UpdateEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(UpdateEncoding::Full),
            "delta" => Ok(UpdateEncoding::Delta),
            _ => Err(format!("不明な更新形式: {} (full または delta)", s)),
        }
    }
}

/// 書き出しオプション
#[derive(Debug, Clone, PartialEq)]
pub struct WriterOptions {
    /// 基準点（省略時は Edwards AFB）
    pub reference_point: Option<GeoPoint>,
    pub encoding: UpdateEncoding,
    /// オブジェクトIDの開始値（16進で出力）
    pub object_id_base: u64,
    /// 省略時は単一エピソードならそのID
    pub title: Option<String>,
    pub author: String,
    /// 省略時は最も早い `start_time`
    pub reference_time: Option<DateTime<Utc>>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            reference_point: None,
            encoding: UpdateEncoding::Full,
            object_id_base: 0x100,
            title: None,
            author: "acmi-bridge".to_string(),
            reference_time: None,
        }
    }
}

const OBJECT_TYPE: &str = "Air+FixedWing";
const COALITION: &str = "Blue";
const COLOR: &str = "Blue";

/// オブジェクトごとの直前フレームの出力状態
#[derive(Debug, Default)]
struct ObjectState {
    id: String,
    /// フレームごとに出力するキーの書式化済み値
    previous: BTreeMap<String, String>,
    previous_transform: Option<[String; 6]>,
}

/// ACMIライター
#[derive(Debug, Clone, Default)]
pub struct AcmiWriter {
    options: WriterOptions,
}

impl AcmiWriter {
    pub fn new(options: WriterOptions) -> Self {
        Self { options }
    }

    /// 使用する基準点
    pub fn reference_point(&self) -> GeoPoint {
        self.options.reference_point.unwrap_or(EDWARDS_AFB)
    }

    /// ファイルに書き出し
    pub fn write_file(
        &self,
        episodes: &[FlightEpisode],
        path: impl AsRef<Path>,
    ) -> Result<(), AcmiError> {
        let path = path.as_ref();
        let text = self.write_to_string(episodes);
        std::fs::write(path, text).map_err(|e| AcmiError::io(path, e))?;

        info!(
            file = %path.display(),
            episodes = episodes.len(),
            "ACMI_WRITE_FILE: ACMIファイルを書き出しました"
        );
        Ok(())
    }

    /// 文字列に書き出し
    pub fn write_to_string(&self, episodes: &[FlightEpisode]) -> String {
        let reference = self.reference_point();
        let mut out = String::new();
        self.write_header(&mut out, episodes, reference);

        let mut states: Vec<ObjectState> = Vec::with_capacity(episodes.len());
        let mut entries: Vec<(f64, usize, usize)> = Vec::new();
        // `0` はグローバルオブジェクト
        let base = self.options.object_id_base.max(1);

        for (i, episode) in episodes.iter().enumerate() {
            let Some(object_id) = base.checked_add(i as u64) else {
                warn!(
                    episode_id = %episode.episode_id,
                    base = base,
                    "ACMI_WRITE_SKIP: オブジェクトIDが上限を超えるためエピソードをスキップしました"
                );
                states.push(ObjectState::default());
                continue;
            };
            states.push(ObjectState { id: format!("{:x}", object_id), ..ObjectState::default() });

            if episode.trajectory.is_empty() {
                warn!(
                    episode_id = %episode.episode_id,
                    "ACMI_WRITE_SKIP: 軌跡が空のエピソードをスキップしました"
                );
                continue;
            }
            if let Some(index) = episode.first_time_regression() {
                warn!(
                    episode_id = %episode.episode_id,
                    index = index,
                    "ACMI_WRITE_UNSORTED: 軌跡の時刻が逆行しているため並べ替えて出力します"
                );
            }
            for (j, point) in episode.trajectory.iter().enumerate() {
                if point.timestamp.is_finite() {
                    entries.push((point.timestamp, i, j));
                } else {
                    warn!(
                        episode_id = %episode.episode_id,
                        index = j,
                        timestamp = point.timestamp,
                        "ACMI_WRITE_SKIP: 時刻が有限でないデータ点をスキップしました"
                    );
                }
            }
        }

        // 安定ソートなので同時刻は入力順を保つ
        entries.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut remaining: Vec<usize> = vec![0; episodes.len()];
        for (_, i, _) in &entries {
            remaining[*i] += 1;
        }
        let mut current_time: Option<f64> = None;
        let mut in_frame: HashSet<usize> = HashSet::new();
        let mut frames = 0usize;

        for (time, i, j) in entries {
            if current_time != Some(time) || in_frame.contains(&i) {
                out.push_str(&format!("#{}\n", time));
                current_time = Some(time);
                in_frame.clear();
                frames += 1;
            }
            in_frame.insert(i);

            let episode = &episodes[i];
            let first = states[i].previous_transform.is_none();
            remaining[i] -= 1;
            let last = remaining[i] == 0;

            let point = &episode.trajectory[j];
            let line = self.update_line(&mut states[i], episode, point, first, last, reference);
            out.push_str(&line);
            out.push('\n');

            if let Some(events) = &point.events {
                for event in events {
                    out.push_str(&event_line(&states[i].id, event));
                    out.push('\n');
                }
            }

            if last {
                out.push_str(&format!("-{}\n", states[i].id));
            }
        }

        info!(
            episodes = episodes.len(),
            frames = frames,
            encoding = ?self.options.encoding,
            "ACMI_WRITE: ACMIテキストを生成しました"
        );
        out
    }

    fn write_header(&self, out: &mut String, episodes: &[FlightEpisode], reference: GeoPoint) {
        out.push_str("FileType=text/acmi/tacview\n");
        out.push_str("FileVersion=2.2\n");

        let reference_time = self.options.reference_time.or_else(|| {
            episodes
                .iter()
                .map(|e| e.start_time)
                .filter(|t| t.is_finite())
                .min_by(f64::total_cmp)
                .and_then(unix_to_datetime)
        });
        if let Some(time) = reference_time {
            out.push_str(&format!(
                "0,{}={}\n",
                standard::REFERENCE_TIME,
                time.to_rfc3339_opts(SecondsFormat::Millis, true)
            ));
        }

        let title = match (&self.options.title, episodes) {
            (Some(title), _) => title.clone(),
            (None, [single]) => single.episode_id.clone(),
            (None, _) => "RL Flight Episodes".to_string(),
        };
        out.push_str(&format!("0,{}={}\n", standard::TITLE, format_value(&title.into())));
        out.push_str(&format!(
            "0,{}={}\n",
            standard::AUTHOR,
            format_value(&self.options.author.as_str().into())
        ));
        out.push_str(&format!(
            "0,{}={}|{}|{}\n",
            keys::REF_POINT,
            format_number(reference.lat),
            format_number(reference.lon),
            format_number(reference.alt)
        ));
    }

    /// 1データ点分の更新行
    fn update_line(
        &self,
        state: &mut ObjectState,
        episode: &FlightEpisode,
        point: &FlightDataPoint,
        first: bool,
        last: bool,
        reference: GeoPoint,
    ) -> String {
        let delta = self.options.encoding == UpdateEncoding::Delta;
        let transform = transform_field(state, point, reference, delta);
        let mut parts = vec![format!("{}={}", standard::TRANSFORM, transform)];

        if first {
            let mut fixed: Vec<(String, PropertyValue)> = vec![
                (standard::TYPE.into(), OBJECT_TYPE.into()),
                (standard::NAME.into(), episode.agent_id.as_str().into()),
                (standard::PILOT.into(), episode.agent_id.as_str().into()),
                (standard::COALITION.into(), COALITION.into()),
                (standard::COLOR.into(), COLOR.into()),
            ];
            fixed.extend(cam::encode_episode_start(episode));
            parts.extend(fixed.iter().map(|(k, v)| format!("{}={}", k, format_value(v))));
        }

        let mut current: BTreeMap<String, String> = BTreeMap::new();
        let t = &point.telemetry;
        let standard_values = [
            (standard::IAS, t.airspeed),
            (standard::THROTTLE, t.throttle),
            (standard::AOA, t.aoa),
            (standard::AOS, t.aos),
            (standard::HDG, t.heading),
        ];
        for (key, value) in standard_values {
            current.insert(key.to_string(), format_number(value));
        }
        let extensions = cam::encode_kinematics(point)
            .into_iter()
            .chain(cam::encode_rl_metrics(&point.rl_metrics));
        for (key, value) in extensions {
            current.insert(key, format_value(&value));
        }

        for (key, value) in &current {
            if !delta || state.previous.get(key) != Some(value) {
                parts.push(format!("{}={}", key, value));
            }
        }
        // 前フレームから消えたキーは空値で消去
        for key in state.previous.keys().filter(|k| !current.contains_key(*k)) {
            parts.push(format!("{}=", key));
        }
        state.previous = current;

        if last {
            let end = cam::encode_episode_end(episode);
            parts.extend(end.iter().map(|(k, v)| format!("{}={}", k, format_value(v))));
        }

        debug!(
            object_id = %state.id,
            step = point.step,
            properties = parts.len(),
            "ACMI_WRITE_UPDATE: 更新行を生成しました"
        );
        format!("{},{}", state.id, parts.join(","))
    }
}

/// `T=Lon|Lat|Alt|Roll|Pitch|Yaw`（差分形式では不変のサブフィールドを空にする）
fn transform_field(
    state: &mut ObjectState,
    point: &FlightDataPoint,
    reference: GeoPoint,
    delta: bool,
) -> String {
    let geo = geo::to_geodetic(point.position, reference);
    let fields = [
        format_number(geo.lon),
        format_number(geo.lat),
        format_number(geo.alt),
        format_number(point.orientation.roll),
        format_number(point.orientation.pitch),
        format_number(point.orientation.yaw),
    ];

    let text = match (&state.previous_transform, delta) {
        (Some(previous), true) => fields
            .iter()
            .zip(previous.iter())
            .map(|(now, before)| if now == before { "" } else { now.as_str() })
            .collect::<Vec<_>>()
            .join("|"),
        _ => fields.join("|"),
    };
    state.previous_transform = Some(fields);
    text
}

/// `0,Event=<type>|<id>|<message>,...`
fn event_line(object_id: &str, event: &FlightEvent) -> String {
    let mut parts = vec![
        format!(
            "{}={}|{}|{}",
            standard::EVENT,
            escape_text(&event.event_type),
            object_id,
            escape_text(&event.message)
        ),
        format!("{}={}", keys::EVENT_SEVERITY, format_value(&event.severity.as_str().into())),
        format!("{}={}", keys::EVENT_TIME, format_number(event.timestamp)),
    ];
    if let Some(json) = event.metadata.as_ref().and_then(|meta| serde_json::to_string(meta).ok()) {
        parts.push(format!("{}={}", keys::EVENT_META, format_value(&json.into())));
    }
    format!("0,{}", parts.join(","))
}

fn unix_to_datetime(seconds: f64) -> Option<DateTime<Utc>> {
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::common::{Orientation, Position3D, Velocity3D};
    use crate::models::episode::{RlMetrics, Telemetry};

    fn point(timestamp: f64, step: u64, x: f64) -> FlightDataPoint {
        FlightDataPoint {
            timestamp,
            step,
            position: Position3D::new(x, 0.0, 1000.0),
            orientation: Orientation::new(0.0, 0.0, 90.0),
            velocity: Velocity3D::new(100.0, 0.0, 0.0),
            angular_velocity: None,
            telemetry: Telemetry {
                airspeed: 100.0,
                altitude: 1000.0,
                g_force: 1.0,
                ..Telemetry::default()
            },
            rl_metrics: RlMetrics {
                reward: 1.0,
                cumulative_reward: step as f64,
                ..RlMetrics::default()
            },
            events: None,
        }
    }

    fn episode(agent: &str, points: Vec<FlightDataPoint>) -> FlightEpisode {
        FlightEpisode {
            episode_id: format!("{}_ep", agent),
            agent_id: agent.to_string(),
            episode_number: 1,
            start_time: 1_705_314_600.0,
            duration: 1.0,
            total_steps: points.len() as u64,
            total_reward: 2.0,
            success: true,
            termination_reason: "completed".to_string(),
            trajectory: points,
            config: None,
            tags: None,
        }
    }

    #[test]
    fn test_header_lines() {
        let text = AcmiWriter::default().write_to_string(&[episode("a", vec![point(0.0, 0, 0.0)])]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "FileType=text/acmi/tacview");
        assert_eq!(lines[1], "FileVersion=2.2");
        assert_eq!(lines[2], "0,ReferenceTime=2024-01-15T10:30:00.000Z");
        assert_eq!(lines[3], "0,Title=a_ep");
        assert_eq!(lines[5], "0,Agent.RefPoint=34.9054|-117.8839|700.0");
    }

    #[test]
    fn test_first_and_last_frame_contents() {
        let episodes = [episode("a", vec![point(0.0, 0, 0.0), point(0.1, 1, 10.0)])];
        let text = AcmiWriter::default().write_to_string(&episodes);
        let first = text.lines().find(|l| l.starts_with("100,")).unwrap();
        assert!(first.contains("Type=Air+FixedWing"));
        assert!(first.contains("Name=a"));
        assert!(first.contains("Agent.EpisodeID=a_ep"));
        assert!(!first.contains("Agent.Success"));

        let last = text.lines().filter(|l| l.starts_with("100,")).last().unwrap();
        assert!(!last.contains("Type="));
        assert!(last.contains("Agent.Success=true"));
        assert!(last.contains("Agent.TotalSteps=2"));
        assert_eq!(text.lines().last(), Some("-100"));
    }

    #[test]
    fn test_frames_merge_episodes_by_time() {
        let episodes = [
            episode("a", vec![point(0.0, 0, 0.0), point(0.2, 1, 20.0)]),
            episode("b", vec![point(0.0, 0, 5.0), point(0.1, 1, 15.0)]),
        ];
        let text = AcmiWriter::default().write_to_string(&episodes);
        let markers: Vec<&str> = text.lines().filter(|l| l.starts_with('#')).collect();
        assert_eq!(markers, vec!["#0", "#0.1", "#0.2"]);
        assert!(text.contains("\n-101\n#0.2\n"));
    }

    #[test]
    fn test_duplicate_timestamp_opens_new_frame() {
        let episodes = [episode("a", vec![point(1.0, 0, 0.0), point(1.0, 1, 1.0)])];
        let text = AcmiWriter::default().write_to_string(&episodes);
        assert_eq!(text.lines().filter(|l| *l == "#1").count(), 2);
    }

    #[test]
    fn test_tombstone_for_vanished_keys() {
        let mut p0 = point(0.0, 0, 0.0);
        p0.rl_metrics.value_estimate = Some(0.5);
        p0.rl_metrics.action = vec![0.1, 0.2];
        let mut p1 = point(0.1, 1, 1.0);
        p1.rl_metrics.action = vec![0.3];

        let text = AcmiWriter::default().write_to_string(&[episode("a", vec![p0, p1])]);
        let second = text.lines().filter(|l| l.starts_with("100,")).nth(1).unwrap();
        assert!(second.contains("Agent.Value=,") || second.ends_with("Agent.Value="));
        assert!(second.contains("Agent.Action.1="));
        assert!(second.contains("Agent.Action.0=0.3"));
    }

    #[test]
    fn test_delta_encoding_writes_only_changes() {
        let options = WriterOptions { encoding: UpdateEncoding::Delta, ..WriterOptions::default() };
        let episodes = [episode("a", vec![point(0.0, 0, 0.0), point(0.1, 1, 0.0)])];
        let text = AcmiWriter::new(options).write_to_string(&episodes);
        let second = text.lines().filter(|l| l.starts_with("100,")).nth(1).unwrap();
        assert!(second.starts_with("100,T=|||||,"));
        assert!(!second.contains("IAS="));
        assert!(second.contains("Agent.Step=1"));
        assert!(second.contains("Agent.Reward.Cum=1.0"));
    }

    #[test]
    fn test_event_line_and_empty_episode_skip() {
        let mut p = point(0.0, 0, 0.0);
        p.events = Some(vec![FlightEvent {
            timestamp: 0.0,
            event_type: "crash".to_string(),
            severity: "error".to_string(),
            message: "hit ground, hard".to_string(),
            metadata: Some(BTreeMap::from([("speed".to_string(), serde_json::json!(120.5))])),
        }]);
        let episodes = [episode("empty", Vec::new()), episode("a", vec![p])];
        let text = AcmiWriter::default().write_to_string(&episodes);

        assert!(!text.lines().any(|l| l.starts_with("100,")));
        let event = text.lines().find(|l| l.starts_with("0,Event=")).unwrap();
        assert!(event.starts_with("0,Event=crash|101|hit ground\\, hard,"));
        assert!(event.contains("Agent.Event.Severity=error"));
        assert!(event.contains("Agent.Event.Meta=\"{\\\"speed\\\":120.5}\""));
    }

    #[test]
    fn test_zero_object_id_base_never_uses_global_id() {
        let options = WriterOptions { object_id_base: 0, ..WriterOptions::default() };
        let episodes = [
            episode("a", vec![point(0.0, 0, 0.0)]),
            episode("b", vec![point(0.0, 0, 5.0)]),
        ];
        let text = AcmiWriter::new(options).write_to_string(&episodes);
        assert!(!text.lines().any(|l| l.starts_with("0,T=")));
        assert!(text.lines().any(|l| l.starts_with("1,T=")));
        assert!(text.lines().any(|l| l.starts_with("2,T=")));
    }

    #[test]
    fn test_object_id_overflow_skips_episode() {
        let options = WriterOptions { object_id_base: u64::MAX, ..WriterOptions::default() };
        let episodes = [
            episode("a", vec![point(0.0, 0, 0.0)]),
            episode("b", vec![point(0.0, 0, 5.0)]),
        ];
        let text = AcmiWriter::new(options).write_to_string(&episodes);
        assert!(text.contains("ffffffffffffffff,T="));
        assert_eq!(text.lines().filter(|l| l.contains(",T=")).count(), 1);
    }

    #[test]
    fn test_non_finite_timestamps_are_skipped() {
        let points = vec![
            point(0.0, 0, 0.0),
            point(f64::NAN, 1, 1.0),
            point(0.1, 2, 2.0),
            point(f64::INFINITY, 3, 3.0),
        ];
        let text = AcmiWriter::default().write_to_string(&[episode("a", points)]);
        let markers: Vec<&str> = text.lines().filter(|l| l.starts_with('#')).collect();
        assert_eq!(markers, vec!["#0", "#0.1"]);
        assert_eq!(text.lines().filter(|l| l.starts_with("100,")).count(), 2);
        assert_eq!(text.lines().last(), Some("-100"));
        assert!(!text.contains("NaN|") && !text.contains("#inf"));
    }

    #[test]
    fn test_write_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt.acmi");
        let episodes = [episode("a", vec![point(0.0, 0, 0.0)])];
        AcmiWriter::default().write_file(&episodes, &path).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().starts_with("FileType=text/acmi/tacview"));
    }
}
