//! # ACMI コンバーター
//!
//! ACMIオブジェクトと `FlightEpisode` の対応付けを行います。
//!
//! ## 主要機能
//!
//! - 基準点の決定（呼び出し側指定 > `Agent.RefPoint` > 最初の位置）
//! - 測地座標 → ローカル直交座標の変換
//! - CAMキーのデコードと、CAMを持たないACMI向けの代替値
//! - イベントのデータ点への割り当て
//! - ファイル内での agent_id 重複の解消
//!
//! `AcmiWriter` の出力を取り込むと元のエピソードが復元されます。

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::acmi::cam::{self, keys};
use crate::acmi::error::{AcmiError, AcmiWarning, Outcome, WarningKind};
use crate::acmi::geo::{self, GeoPoint, EDWARDS_AFB};
use crate::acmi::parser::{AcmiDocument, AcmiEvent, AcmiObject, AcmiParser, Snapshot};
use crate::acmi::property::{
    resolve_properties, resolve_value, standard, PropertyMap, PropertyValue,
};
use crate::acmi::writer::{AcmiWriter, WriterOptions};
use crate::models::common::{Orientation, Position3D};
use crate::models::episode::{FlightDataPoint, FlightEpisode, FlightEvent, RlMetrics, Telemetry};

/// 取り込み結果
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedEpisodes {
    pub episodes: Vec<FlightEpisode>,
    /// 使用した基準点（書き戻し時に再利用できる）
    pub reference_point: GeoPoint,
}

/// ACMI ⇔ エピソード変換
#[derive(Debug, Clone, Default)]
pub struct AcmiConverter {
    reference_point: Option<GeoPoint>,
}

impl AcmiConverter {
    /// # 引数
    ///
    /// * `reference_point` - 固定の基準点（`None` ならファイルから決定）
    pub fn new(reference_point: Option<GeoPoint>) -> Self {
        Self { reference_point }
    }

    /// ファイルを解析してエピソードに変換
    pub fn import_file(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<Outcome<ImportedEpisodes>, AcmiError> {
        let parsed = AcmiParser::new().parse_file(path)?;
        let mut warnings = parsed.warnings;
        let imported = self.acmi_to_episodes(&parsed.value).drain_into(&mut warnings);
        Ok(Outcome::new(imported, warnings))
    }

    /// 単一エピソードをACMIファイルに書き出し
    pub fn episode_to_acmi(
        &self,
        episode: &FlightEpisode,
        path: impl AsRef<Path>,
        options: &WriterOptions,
    ) -> Result<(), AcmiError> {
        self.episodes_to_acmi(std::slice::from_ref(episode), path, options)
    }

    /// 複数エピソードを1つのACMIファイルに書き出し
    pub fn episodes_to_acmi(
        &self,
        episodes: &[FlightEpisode],
        path: impl AsRef<Path>,
        options: &WriterOptions,
    ) -> Result<(), AcmiError> {
        let mut options = options.clone();
        if options.reference_point.is_none() {
            options.reference_point = self.reference_point;
        }
        AcmiWriter::new(options).write_file(episodes, path)
    }

    /// 解析済みドキュメントをエピソードに変換
    pub fn acmi_to_episodes(&self, document: &AcmiDocument) -> Outcome<ImportedEpisodes> {
        let mut warnings = Vec::new();
        let offset = ReferenceOffset::from_globals(&document.header.globals);
        let reference = self.resolve_reference(document, offset, &mut warnings);

        let mut episodes = Vec::new();
        let mut used_ids: HashSet<String> = HashSet::new();

        for object in &document.objects {
            let positioned: Vec<&Snapshot> = object
                .snapshots
                .iter()
                .filter(|s| s.transform.position().is_some())
                .collect();
            if positioned.is_empty() {
                let warning = AcmiWarning::new(WarningKind::NoPosition).for_object(&object.id);
                push_unique(&mut warnings, warning);
                continue;
            }

            let events: Vec<&AcmiEvent> = document
                .events
                .iter()
                .filter(|e| e.object_id.as_deref() == Some(object.id.as_str()))
                .collect();

            let mut episode =
                convert_object(object, &positioned, &events, reference, offset, &mut warnings);

            if !used_ids.insert(episode.agent_id.clone()) {
                let renamed = format!("{}_{}", episode.agent_id, object.id);
                debug!(
                    agent_id = %episode.agent_id,
                    renamed = %renamed,
                    "ACMI_CONVERT_RENAME: 重複した agent_id を変更しました"
                );
                episode.agent_id = renamed;
                used_ids.insert(episode.agent_id.clone());
            }
            episodes.push(episode);
        }

        for event in document.events.iter().filter(|e| e.object_id.is_none()) {
            debug!(
                event_type = %event.event_type,
                line = event.line,
                "ACMI_CONVERT_SKIP: 対象オブジェクトのないイベントを無視しました"
            );
        }

        for warning in &warnings {
            warn!(warning = %warning, "ACMI_CONVERT_WARNING: 回復可能な問題を検出しました");
        }
        info!(
            episodes = episodes.len(),
            ref_lat = reference.lat,
            ref_lon = reference.lon,
            ref_alt = reference.alt,
            "ACMI_CONVERT: エピソードに変換しました"
        );

        Outcome::new(ImportedEpisodes { episodes, reference_point: reference }, warnings)
    }

    fn resolve_reference(
        &self,
        document: &AcmiDocument,
        offset: ReferenceOffset,
        warnings: &mut Vec<AcmiWarning>,
    ) -> GeoPoint {
        if let Some(reference) = self.reference_point {
            return reference;
        }

        if let Some(raw) = document.header.globals.get(keys::REF_POINT) {
            match parse_ref_point(raw) {
                Some(reference) => return reference,
                None => warnings.push(AcmiWarning::new(WarningKind::MalformedValue {
                    key: keys::REF_POINT.to_string(),
                    raw: raw.clone(),
                })),
            }
        }

        document
            .objects
            .iter()
            .flat_map(|o| o.snapshots.iter())
            .find_map(|s| s.transform.position())
            .map(|(lon, lat, alt)| offset.apply(lon, lat, alt))
            .unwrap_or(EDWARDS_AFB)
    }
}

/// Tacview の `ReferenceLongitude` / `ReferenceLatitude`
#[derive(Debug, Clone, Copy, Default)]
struct ReferenceOffset {
    lon: f64,
    lat: f64,
}

impl ReferenceOffset {
    fn from_globals(globals: &BTreeMap<String, String>) -> Self {
        let read = |key: &str| {
            globals
                .get(key)
                .and_then(|raw| resolve_value(key, raw))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0)
        };
        Self {
            lon: read(standard::REFERENCE_LONGITUDE),
            lat: read(standard::REFERENCE_LATITUDE),
        }
    }

    fn apply(&self, lon: f64, lat: f64, alt: f64) -> GeoPoint {
        GeoPoint::new(lat + self.lat, lon + self.lon, alt)
    }
}

/// `lat|lon|alt`
fn parse_ref_point(raw: &str) -> Option<GeoPoint> {
    let values: Vec<f64> = raw
        .trim()
        .trim_matches('"')
        .split('|')
        .map(|v| v.trim().parse::<f64>().ok())
        .collect::<Option<_>>()?;
    match values.as_slice() {
        [lat, lon, alt] => Some(GeoPoint::new(*lat, *lon, *alt)),
        _ => None,
    }
}

fn push_unique(warnings: &mut Vec<AcmiWarning>, warning: AcmiWarning) {
    if !warnings.contains(&warning) {
        warnings.push(warning);
    }
}

fn number(props: &PropertyMap, key: &str) -> Option<f64> {
    props.get(key).and_then(PropertyValue::as_f64)
}

/// 1オブジェクト → 1エピソード
fn convert_object(
    object: &AcmiObject,
    positioned: &[&Snapshot],
    events: &[&AcmiEvent],
    reference: GeoPoint,
    offset: ReferenceOffset,
    warnings: &mut Vec<AcmiWarning>,
) -> FlightEpisode {
    let mut trajectory = Vec::with_capacity(positioned.len());
    let mut final_props = PropertyMap::new();

    for (index, snapshot) in positioned.iter().enumerate() {
        let props = resolve_properties(&snapshot.properties);
        for warning in props.warnings {
            push_unique(warnings, warning.for_object(&object.id));
        }
        let props = props.value;

        let Some((lon, lat, alt)) = snapshot.transform.position() else {
            continue;
        };
        let point = offset.apply(lon, lat, alt);
        if !point.is_plausible() {
            let kind = WarningKind::ImplausibleCoordinates {
                lat: point.lat,
                lon: point.lon,
                alt: point.alt,
            };
            push_unique(warnings, AcmiWarning::new(kind).for_object(&object.id));
        }

        let metrics = cam::decode_rl_metrics(&props);
        for warning in metrics.warnings {
            push_unique(warnings, warning.for_object(&object.id));
        }

        let position = geo::to_cartesian(point, reference);
        trajectory.push(data_point(index, snapshot, &props, position, metrics.value));
        final_props = props;
    }

    attach_events(&mut trajectory, positioned, events);

    let meta = cam::decode_episode_metadata(&final_props);
    let has_cam = !meta.is_empty();
    let agent_id = meta
        .agent_id
        .or_else(|| final_props.get(standard::NAME).map(PropertyValue::to_text))
        .unwrap_or_else(|| object.id.clone());

    let (first_time, last_time) = match (trajectory.first(), trajectory.last()) {
        (Some(first), Some(last)) => (first.timestamp, last.timestamp),
        _ => (object.created_at, object.created_at),
    };
    let last_cumulative =
        trajectory.last().map(|p| p.rl_metrics.cumulative_reward).unwrap_or(0.0);

    debug!(
        object_id = %object.id,
        agent_id = %agent_id,
        points = trajectory.len(),
        cam = has_cam,
        "ACMI_CONVERT_OBJECT: オブジェクトを変換しました"
    );

    FlightEpisode {
        episode_id: meta.episode_id.unwrap_or_else(|| format!("acmi_{}", object.id)),
        agent_id,
        episode_number: meta.episode_number.unwrap_or(0),
        start_time: meta.start_time.unwrap_or(first_time),
        duration: meta.duration.unwrap_or(last_time - first_time),
        total_steps: meta.total_steps.unwrap_or(trajectory.len() as u64),
        total_reward: meta.total_reward.unwrap_or(last_cumulative),
        success: meta.success.unwrap_or(true),
        termination_reason: meta.termination_reason.unwrap_or_else(|| "completed".to_string()),
        trajectory,
        config: meta.config,
        tags: meta.tags,
    }
}

fn data_point(
    index: usize,
    snapshot: &Snapshot,
    props: &PropertyMap,
    position: Position3D,
    rl_metrics: RlMetrics,
) -> FlightDataPoint {
    let transform = &snapshot.transform;
    let roll = transform.roll.unwrap_or(0.0);
    let pitch = transform.pitch.unwrap_or(0.0);
    let yaw = transform.yaw.unwrap_or(0.0);

    let airspeed = number(props, standard::IAS)
        .or_else(|| number(props, standard::TAS))
        .unwrap_or(0.0);
    let heading = number(props, standard::HDG)
        .or_else(|| number(props, standard::HEADING))
        .or(transform.heading)
        .unwrap_or(yaw);

    let velocity = cam::decode_velocity(props)
        .unwrap_or_else(|| geo::velocity_from_airspeed(airspeed, pitch, yaw));

    let mut telemetry = Telemetry {
        airspeed,
        altitude: transform.alt.unwrap_or(0.0),
        g_force: 1.0,
        throttle: number(props, standard::THROTTLE).unwrap_or(0.0),
        aoa: number(props, standard::AOA).unwrap_or(0.0),
        aos: number(props, standard::AOS).unwrap_or(0.0),
        heading,
        vertical_speed: velocity.z,
        turn_rate: number(props, standard::TURN_RATE).unwrap_or(0.0),
        bank_angle: roll,
        ..Telemetry::default()
    };
    cam::apply_telemetry_extensions(props, &mut telemetry);

    FlightDataPoint {
        timestamp: snapshot.time,
        step: cam::decode_step(props).unwrap_or(index as u64),
        position,
        orientation: Orientation::new(roll, pitch, yaw),
        velocity,
        angular_velocity: cam::decode_angular_velocity(props),
        telemetry,
        rl_metrics,
        events: None,
    }
}

/// イベントを、そのフレーム以前で最新のデータ点に割り当てる
fn attach_events(
    trajectory: &mut [FlightDataPoint],
    positioned: &[&Snapshot],
    events: &[&AcmiEvent],
) {
    for event in events {
        let index = positioned
            .iter()
            .rposition(|s| s.frame <= event.frame)
            .unwrap_or(0);
        let Some(point) = trajectory.get_mut(index) else {
            continue;
        };
        point.events.get_or_insert_with(Vec::new).push(flight_event(event));
    }
}

fn flight_event(event: &AcmiEvent) -> FlightEvent {
    let props = resolve_properties(&event.properties).value;
    let metadata = props
        .get(keys::EVENT_META)
        .map(PropertyValue::to_text)
        .and_then(|json| serde_json::from_str::<BTreeMap<String, serde_json::Value>>(&json).ok());

    FlightEvent {
        timestamp: number(&props, keys::EVENT_TIME).unwrap_or(event.time),
        event_type: event.event_type.clone(),
        severity: props
            .get(keys::EVENT_SEVERITY)
            .map(PropertyValue::to_text)
            .unwrap_or_else(|| "info".to_string()),
        message: event.message.clone(),
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acmi::writer::UpdateEncoding;
    use crate::models::common::{AngularVelocity, Velocity3D};
    use serde_json::json;

    fn point(timestamp: f64, step: u64) -> FlightDataPoint {
        let t = timestamp;
        FlightDataPoint {
            timestamp,
            step,
            position: Position3D::new(100.0 * t, 50.0 * t - 20.0, 1500.0 + 3.0 * t),
            orientation: Orientation::new(5.0 * t, 2.5, 63.43),
            velocity: Velocity3D::new(100.0, 50.0, 3.0),
            angular_velocity: if step % 2 == 0 {
                Some(AngularVelocity::new(0.01, -0.02, 0.003))
            } else {
                None
            },
            telemetry: Telemetry {
                airspeed: 111.84,
                altitude: 1500.0 + 3.0 * t,
                g_force: 1.2,
                throttle: 0.75,
                aoa: 3.1,
                aos: -0.4,
                heading: 63.43,
                vertical_speed: 3.0,
                turn_rate: 0.5,
                bank_angle: 5.0 * t,
                aileron: Some(0.1),
                elevator: if step == 0 { Some(-0.05) } else { None },
                rudder: None,
            },
            rl_metrics: RlMetrics {
                reward: 0.5,
                cumulative_reward: 0.5 * (step + 1) as f64,
                action: if step == 1 { vec![0.2] } else { vec![0.1, -0.3, 0.7] },
                policy_logprob: Some(-1.25),
                value_estimate: if step == 0 { Some(0.0) } else { None },
                advantage: None,
                entropy: Some(0.9),
                reward_components: Some(BTreeMap::from([
                    ("tracking".to_string(), 0.3),
                    ("energy".to_string(), 0.2),
                ])),
            },
            events: None,
        }
    }

    fn episode(agent_id: &str, steps: u64) -> FlightEpisode {
        let mut trajectory: Vec<FlightDataPoint> =
            (0..steps).map(|s| point(s as f64 * 0.1, s)).collect();
        if let Some(last) = trajectory.last_mut() {
            last.events = Some(vec![FlightEvent {
                timestamp: last.timestamp,
                event_type: "timeout".to_string(),
                severity: "warning".to_string(),
                message: "time limit, reached".to_string(),
                metadata: Some(BTreeMap::from([("limit".to_string(), json!(30))])),
            }]);
        }
        FlightEpisode {
            episode_id: format!("{}_episode_7", agent_id),
            agent_id: agent_id.to_string(),
            episode_number: 7,
            start_time: 1_705_314_600.5,
            duration: (steps as f64 - 1.0) * 0.1,
            total_steps: steps,
            total_reward: 0.5 * steps as f64,
            success: false,
            termination_reason: "timeout".to_string(),
            trajectory,
            config: Some(BTreeMap::from([
                ("algorithm".to_string(), json!("PPO")),
                ("hyper".to_string(), json!({"lr": 0.0003, "gamma": 0.99, "sizes": [64, 64]})),
                ("seed".to_string(), json!(42)),
                ("deterministic".to_string(), json!(false)),
            ])),
            tags: Some(vec!["eval".to_string(), "42".to_string()]),
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a.is_nan() && b.is_nan()) || (a - b).abs() <= 1e-3
    }

    fn assert_point_eq(a: &FlightDataPoint, b: &FlightDataPoint) {
        assert!(close(a.timestamp, b.timestamp));
        assert_eq!(a.step, b.step);
        let drift = a.position.distance_3d(&b.position);
        assert!(drift <= 1e-3, "{:?} vs {:?}", a.position, b.position);
        assert!(close(a.orientation.roll, b.orientation.roll));
        assert!(close(a.orientation.pitch, b.orientation.pitch));
        assert!(close(a.orientation.yaw, b.orientation.yaw));
        assert_eq!(a.velocity, b.velocity);
        assert_eq!(a.angular_velocity, b.angular_velocity);
        assert_eq!(a.telemetry, b.telemetry);
        assert_eq!(a.rl_metrics, b.rl_metrics);
        assert_eq!(a.events, b.events);
    }

    fn assert_episode_eq(a: &FlightEpisode, b: &FlightEpisode) {
        assert_eq!(a.episode_id, b.episode_id);
        assert_eq!(a.agent_id, b.agent_id);
        assert_eq!(a.episode_number, b.episode_number);
        assert_eq!(a.start_time, b.start_time);
        assert!(close(a.duration, b.duration));
        assert_eq!(a.total_steps, b.total_steps);
        assert_eq!(a.total_reward, b.total_reward);
        assert_eq!(a.success, b.success);
        assert_eq!(a.termination_reason, b.termination_reason);
        assert_eq!(a.config, b.config);
        assert_eq!(a.tags, b.tags);
        assert_eq!(a.trajectory.len(), b.trajectory.len());
        for (pa, pb) in a.trajectory.iter().zip(&b.trajectory) {
            assert_point_eq(pa, pb);
        }
    }

    fn round_trip(
        episodes: &[FlightEpisode],
        encoding: UpdateEncoding,
    ) -> Outcome<ImportedEpisodes> {
        round_trip_with(episodes, WriterOptions { encoding, ..WriterOptions::default() })
    }

    fn round_trip_with(
        episodes: &[FlightEpisode],
        options: WriterOptions,
    ) -> Outcome<ImportedEpisodes> {
        let text = AcmiWriter::new(options).write_to_string(episodes);
        let parsed = AcmiParser::new().parse_str(&text).unwrap();
        assert!(parsed.warnings.is_empty(), "{:?}", parsed.warnings);
        AcmiConverter::default().acmi_to_episodes(&parsed.value)
    }

    #[test]
    fn test_round_trip_full_encoding() {
        let original = episode("agent_01", 5);
        let outcome = round_trip(std::slice::from_ref(&original), UpdateEncoding::Full);
        assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);
        assert_eq!(outcome.value.reference_point, EDWARDS_AFB);
        assert_eq!(outcome.value.episodes.len(), 1);
        assert_episode_eq(&outcome.value.episodes[0], &original);
    }

    #[test]
    fn test_round_trip_delta_encoding() {
        let original = episode("agent_01", 6);
        let outcome = round_trip(std::slice::from_ref(&original), UpdateEncoding::Delta);
        assert_episode_eq(&outcome.value.episodes[0], &original);
    }

    #[test]
    fn test_round_trip_multiple_episodes() {
        let originals = vec![episode("alpha", 4), episode("bravo", 7), episode("charlie", 1)];
        let outcome = round_trip(&originals, UpdateEncoding::Full);
        assert_eq!(outcome.value.episodes.len(), 3);
        for (imported, original) in outcome.value.episodes.iter().zip(&originals) {
            assert_episode_eq(imported, original);
        }
    }

    #[test]
    fn test_duplicate_timestamps_survive() {
        let mut original = episode("agent_01", 3);
        original.trajectory[1].timestamp = original.trajectory[0].timestamp;
        let outcome = round_trip(std::slice::from_ref(&original), UpdateEncoding::Delta);
        assert_episode_eq(&outcome.value.episodes[0], &original);
    }

    #[test]
    fn test_backslashes_and_array_like_strings_survive() {
        let mut original = episode("agent\\", 3);
        original.episode_id = "runs\\ep,7".to_string();
        if let Some(config) = original.config.as_mut() {
            config.insert("path".to_string(), json!("C:\\runs\\"));
            config.insert("label".to_string(), json!("[not, an array]"));
            config.insert("literal".to_string(), json!("[1, 2]"));
            config.insert("prefixed".to_string(), json!("json:[3]"));
            config.insert("layers".to_string(), json!([[64, 64], "tanh"]));
        }
        for encoding in [UpdateEncoding::Full, UpdateEncoding::Delta] {
            let outcome = round_trip(std::slice::from_ref(&original), encoding);
            assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);
            assert_episode_eq(&outcome.value.episodes[0], &original);
        }
    }

    #[test]
    fn test_zero_object_id_base_keeps_every_episode() {
        let originals = vec![episode("alpha", 2), episode("bravo", 3)];
        let options = WriterOptions { object_id_base: 0, ..WriterOptions::default() };
        let outcome = round_trip_with(&originals, options);
        assert_eq!(outcome.value.episodes.len(), 2);
        for (imported, original) in outcome.value.episodes.iter().zip(&originals) {
            assert_episode_eq(imported, original);
        }
    }

    #[test]
    fn test_non_finite_timestamps_are_dropped_on_export() {
        let mut original = episode("agent_01", 4);
        original.trajectory[1].timestamp = f64::NAN;
        original.trajectory[2].timestamp = f64::NEG_INFINITY;
        let outcome = round_trip(std::slice::from_ref(&original), UpdateEncoding::Full);

        let imported = &outcome.value.episodes[0];
        assert_eq!(imported.trajectory.len(), 2);
        assert_point_eq(&imported.trajectory[0], &original.trajectory[0]);
        assert_point_eq(&imported.trajectory[1], &original.trajectory[3]);
        assert_eq!(imported.total_steps, original.total_steps);
    }

    #[test]
    fn test_non_cam_import_uses_fallbacks() {
        let text = "FileType=text/acmi/tacview\nFileVersion=2.1\n\
                    0,ReferenceLongitude=-118,ReferenceLatitude=34\n\
                    #0\na01,T=0.1|0.2|1000|0|0|90,Name=Viper,IAS=200\n\
                    #1\na01,T=0.102|0.2|1010\n\
                    #2\nb02,Type=Ground\n";
        let parsed = AcmiParser::new().parse_str(text).unwrap();
        let outcome = AcmiConverter::default().acmi_to_episodes(&parsed.value);
        let imported = &outcome.value;

        let reference = imported.reference_point;
        assert!((reference.lat - 34.2).abs() < 1e-9 && (reference.lon + 117.9).abs() < 1e-9);
        assert_eq!(reference.alt, 1000.0);
        assert_eq!(imported.episodes.len(), 1);
        assert_eq!(outcome.warnings[0].kind, WarningKind::NoPosition);

        let episode = &imported.episodes[0];
        assert_eq!(episode.agent_id, "Viper");
        assert_eq!(episode.episode_id, "acmi_a01");
        assert!(episode.success);
        assert_eq!(episode.termination_reason, "completed");
        assert_eq!(episode.total_steps, 2);
        assert_eq!(episode.duration, 1.0);
        assert_eq!(episode.start_time, 0.0);

        let first = &episode.trajectory[0];
        assert_eq!(first.rl_metrics, RlMetrics::default());
        assert_eq!(first.position, Position3D::new(0.0, 0.0, 0.0));
        assert_eq!(first.telemetry.airspeed, 200.0);
        assert_eq!(first.telemetry.heading, 90.0);
        assert_eq!(first.telemetry.g_force, 1.0);
        assert_eq!(first.telemetry.altitude, 1000.0);
        assert!((first.velocity.x - 200.0).abs() < 1e-9);
        assert!(first.velocity.y.abs() < 1e-9);

        let second = &episode.trajectory[1];
        assert_eq!(second.step, 1);
        assert!(second.position.x > 0.0);
        assert_eq!(second.position.z, 10.0);
    }

    #[test]
    fn test_reference_point_priority() {
        let text = "FileType=text/acmi/tacview\n\
                    0,Agent.RefPoint=35.0|-117.0|500.0\n\
                    #0\na01,T=-117.1|35.1|600\n";
        let parsed = AcmiParser::new().parse_str(text).unwrap().value;

        let from_file = AcmiConverter::default().acmi_to_episodes(&parsed).value;
        assert_eq!(from_file.reference_point, GeoPoint::new(35.0, -117.0, 500.0));

        let fixed = GeoPoint::new(10.0, 20.0, 0.0);
        let from_caller = AcmiConverter::new(Some(fixed)).acmi_to_episodes(&parsed).value;
        assert_eq!(from_caller.reference_point, fixed);
    }

    #[test]
    fn test_duplicate_agent_ids_are_suffixed() {
        let text = "FileType=text/acmi/tacview\n\
                    #0\na01,T=0|0|0,Name=Viper\na02,T=0|0|0,Name=Viper\n";
        let parsed = AcmiParser::new().parse_str(text).unwrap().value;
        let episodes = AcmiConverter::default().acmi_to_episodes(&parsed).value.episodes;
        assert_eq!(episodes[0].agent_id, "Viper");
        assert_eq!(episodes[1].agent_id, "Viper_a02");
    }

    #[test]
    fn test_episode_to_acmi_file_and_import() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("episode.txt.acmi");
        let original = episode("agent_01", 3);
        let reference = GeoPoint::new(47.5, 8.5, 400.0);

        AcmiConverter::new(Some(reference))
            .episode_to_acmi(&original, &path, &WriterOptions::default())
            .unwrap();
        let outcome = AcmiConverter::default().import_file(&path).unwrap();
        assert_eq!(outcome.value.reference_point, reference);
        assert_episode_eq(&outcome.value.episodes[0], &original);
    }
}
