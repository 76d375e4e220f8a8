//! # ACMI パーサー
//!
//! ACMIテキストを `AcmiDocument` に解析します。
//!
//! ## 主要機能
//!
//! - ヘッダー（`FileType` / `FileVersion`）とグローバルプロパティ（`0,`行）
//! - 時刻マーカー（`#t`）によるフレーム分割と単調性チェック
//! - オブジェクト更新の累積（部分更新を直前の状態に畳み込み）
//! - `T=` の部分更新（空サブフィールドは直前値を保持）
//! - エスケープ（`\,`）と行継続（行末の `\`）
//!
//! 致命的な構造エラーは `AcmiError`、回復可能な問題は警告として
//! `Outcome` に集約されます。

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, info, warn};

use crate::acmi::error::{AcmiError, AcmiWarning, Outcome, WarningKind};
use crate::acmi::property::{split_unescaped_commas, standard, unescape_text};

/// 生のプロパティ（キー → 未解決の文字列値）
pub type RawProperties = BTreeMap<String, String>;

/// ファイルヘッダーとグローバルプロパティ
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcmiHeader {
    pub file_type: Option<String>,
    pub file_version: Option<String>,
    /// `0,` 行のプロパティ（イベント行を除く）
    pub globals: RawProperties,
    /// `ReferenceTime` を解釈したもの
    pub reference_time: Option<DateTime<Utc>>,
}

/// 位置・姿勢（`T=`）
///
/// 各サブフィールドは一度も設定されていなければ `None` です。
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Transform {
    pub lon: Option<f64>,
    pub lat: Option<f64>,
    pub alt: Option<f64>,
    pub roll: Option<f64>,
    pub pitch: Option<f64>,
    pub yaw: Option<f64>,
    pub u: Option<f64>,
    pub v: Option<f64>,
    pub heading: Option<f64>,
}

impl Transform {
    /// 経度・緯度・高度がすべて揃っているか
    pub fn position(&self) -> Option<(f64, f64, f64)> {
        Some((self.lon?, self.lat?, self.alt?))
    }

    /// `T=` の値を畳み込む
    ///
    /// # 戻り値
    ///
    /// 解釈できなかったサブフィールド（インデックス, 生文字列）
    pub fn apply(&mut self, raw: &str) -> Vec<(usize, String)> {
        let fields: Vec<&str> = raw.split('|').collect();
        let Transform { lon, lat, alt, roll, pitch, yaw, u, v, heading } = self;
        let slots: Vec<&mut Option<f64>> = match fields.len() {
            3 => vec![lon, lat, alt],
            5 => vec![lon, lat, alt, u, v],
            6 => vec![lon, lat, alt, roll, pitch, yaw],
            9 => vec![lon, lat, alt, roll, pitch, yaw, u, v, heading],
            // サブフィールド数が不正な場合は全体を不正とする
            n => return vec![(n, raw.to_string())],
        };

        let mut malformed = Vec::new();
        for (index, (field, slot)) in fields.iter().zip(slots).enumerate() {
            let field = field.trim();
            if field.is_empty() {
                continue;
            }
            match field.parse::<f64>() {
                Ok(value) if value.is_finite() => *slot = Some(value),
                _ => malformed.push((index, field.to_string())),
            }
        }
        malformed
    }
}

/// ある時点でのオブジェクトの累積状態
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub time: f64,
    /// フレーム番号（最初の時刻マーカーより前は0）
    pub frame: usize,
    pub transform: Transform,
    /// このフレームまでに設定されたすべてのプロパティ
    pub properties: RawProperties,
}

/// ACMIオブジェクト
#[derive(Debug, Clone, PartialEq)]
pub struct AcmiObject {
    pub id: String,
    pub created_at: f64,
    pub removed_at: Option<f64>,
    pub snapshots: Vec<Snapshot>,
}

/// `0,Event=` 行
#[derive(Debug, Clone, PartialEq)]
pub struct AcmiEvent {
    pub time: f64,
    pub frame: usize,
    pub line: usize,
    pub event_type: String,
    pub object_id: Option<String>,
    pub message: String,
    /// 同じ行の他のプロパティ（`Agent.Event.*` など）
    pub properties: RawProperties,
}

/// 解析結果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcmiDocument {
    pub header: AcmiHeader,
    /// 作成順のオブジェクト
    pub objects: Vec<AcmiObject>,
    pub events: Vec<AcmiEvent>,
    /// 時刻マーカーの数
    pub frame_count: usize,
}

impl AcmiDocument {
    pub fn object(&self, id: &str) -> Option<&AcmiObject> {
        self.objects.iter().find(|o| o.id == id)
    }

    /// 最初と最後の時刻マーカー
    pub fn time_span(&self) -> Option<(f64, f64)> {
        let times = self.objects.iter().flat_map(|o| o.snapshots.iter().map(|s| s.time));
        times.fold(None, |span, t| match span {
            None => Some((t, t)),
            Some((lo, hi)) => Some((f64::min(lo, t), f64::max(hi, t))),
        })
    }
}

/// ACMIパーサー
#[derive(Debug, Clone, Default)]
pub struct AcmiParser;

impl AcmiParser {
    pub fn new() -> Self {
        Self
    }

    /// ファイルを解析
    pub fn parse_file(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<Outcome<AcmiDocument>, AcmiError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| AcmiError::io(path, e))?;
        let text = String::from_utf8_lossy(&bytes);

        info!(
            file = %path.display(),
            bytes = bytes.len(),
            "ACMI_PARSE_START: ACMIファイルを解析します"
        );
        self.parse_str(&text)
    }

    /// 文字列を解析
    pub fn parse_str(&self, text: &str) -> Result<Outcome<AcmiDocument>, AcmiError> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut state = ParseState::default();

        for (line_no, line) in logical_lines(text) {
            state.process_line(line_no, &line)?;
        }

        let outcome = state.finish();
        info!(
            objects = outcome.value.objects.len(),
            frames = outcome.value.frame_count,
            events = outcome.value.events.len(),
            warnings = outcome.warnings.len(),
            "ACMI_PARSE_DONE: 解析完了"
        );
        Ok(outcome)
    }
}

/// 行継続を結合した論理行（開始行番号, 内容）
fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (index, raw) in text.split('\n').enumerate() {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        let (start, mut current) = match pending.take() {
            Some((start, mut joined)) => {
                joined.push('\n');
                (start, joined)
            }
            None => (index + 1, String::new()),
        };
        current.push_str(raw);

        if ends_with_unescaped_backslash(raw) {
            pending = Some((start, current));
        } else {
            lines.push((start, current));
        }
    }
    if let Some(rest) = pending {
        lines.push(rest);
    }
    lines
}

fn ends_with_unescaped_backslash(line: &str) -> bool {
    let trailing = line.chars().rev().take_while(|c| *c == '\\').count();
    trailing % 2 == 1
}

/// オブジェクトごとの累積状態
#[derive(Debug, Default)]
struct Accumulator {
    properties: RawProperties,
    transform: Transform,
    last_frame: Option<usize>,
}

#[derive(Debug, Default)]
struct ParseState {
    document: AcmiDocument,
    warnings: Vec<AcmiWarning>,
    index: HashMap<String, usize>,
    accumulators: Vec<Accumulator>,
    current_time: f64,
    current_frame: usize,
    seen_marker: bool,
}

impl ParseState {
    fn warn(&mut self, warning: AcmiWarning) {
        warn!(warning = %warning, "ACMI_PARSE_WARNING: 回復可能な問題を検出しました");
        self.warnings.push(warning);
    }

    fn process_line(&mut self, line_no: usize, line: &str) -> Result<(), AcmiError> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("//") {
            return Ok(());
        }

        if let Some(marker) = trimmed.strip_prefix('#') {
            return self.time_marker(line_no, marker);
        }

        if !self.seen_marker {
            if let Some(value) = trimmed.strip_prefix("FileType=") {
                self.document.header.file_type = Some(value.trim().to_string());
                return Ok(());
            }
            if let Some(value) = trimmed.strip_prefix("FileVersion=") {
                self.document.header.file_version = Some(value.trim().to_string());
                return Ok(());
            }
        }

        if let Some(id) = trimmed.strip_prefix('-') {
            return self.removal(line_no, id.trim(), trimmed);
        }

        match line.trim_start().split_once(',') {
            Some((id, _)) if id.trim().is_empty() => Err(AcmiError::MalformedLine {
                line: line_no,
                content: trimmed.to_string(),
            }),
            Some((id, rest)) => {
                let properties = self.split_properties(line_no, rest);
                if id.trim() == "0" {
                    self.global(line_no, properties);
                } else {
                    self.update(line_no, id.trim(), properties);
                }
                Ok(())
            }
            None => {
                debug!(
                    line = line_no,
                    content = %trimmed,
                    "ACMI_PARSE_SKIP: 未知の行を無視しました"
                );
                Ok(())
            }
        }
    }

    fn time_marker(&mut self, line_no: usize, marker: &str) -> Result<(), AcmiError> {
        let time = match marker.trim().parse::<f64>() {
            Ok(t) if t.is_finite() => t,
            _ => {
                return Err(AcmiError::InvalidTimeMarker {
                    line: line_no,
                    raw: marker.to_string(),
                })
            }
        };

        if self.seen_marker && time < self.current_time {
            return Err(AcmiError::NonMonotonicTime {
                line: line_no,
                previous: self.current_time,
                found: time,
            });
        }

        self.current_time = time;
        self.current_frame += 1;
        self.seen_marker = true;
        self.document.frame_count += 1;
        Ok(())
    }

    fn removal(&mut self, line_no: usize, id: &str, content: &str) -> Result<(), AcmiError> {
        if id.is_empty() {
            let content = content.to_string();
            return Err(AcmiError::MalformedLine { line: line_no, content });
        }
        match self.index.get(id) {
            Some(&i) => {
                let object = &mut self.document.objects[i];
                if object.removed_at.is_none() {
                    object.removed_at = Some(self.current_time);
                }
            }
            None => debug!(
                line = line_no,
                object_id = %id,
                "ACMI_PARSE_SKIP: 未登場オブジェクトの削除を無視しました"
            ),
        }
        Ok(())
    }

    fn split_properties(&mut self, line_no: usize, rest: &str) -> RawProperties {
        let mut properties = RawProperties::new();
        for part in split_unescaped_commas(rest) {
            if part.trim().is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some((key, value)) => {
                    let key = key.trim();
                    let value = if key == standard::TRANSFORM {
                        value.to_string()
                    } else {
                        unescape_text(value)
                    };
                    properties.insert(key.to_string(), value);
                }
                None => self.warn(
                    AcmiWarning::new(WarningKind::MalformedProperty { raw: part }).at_line(line_no),
                ),
            }
        }
        properties
    }

    fn global(&mut self, line_no: usize, mut properties: RawProperties) {
        if let Some(event) = properties.remove(standard::EVENT) {
            let mut fields = event.splitn(3, '|');
            let event_type = fields.next().unwrap_or_default().trim().to_string();
            let object_id = fields
                .next()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string);
            let message = fields.next().unwrap_or_default().to_string();

            self.document.events.push(AcmiEvent {
                time: self.current_time,
                frame: self.current_frame,
                line: line_no,
                event_type,
                object_id,
                message,
                properties,
            });
            return;
        }

        if let Some(raw) = properties.get(standard::REFERENCE_TIME) {
            match parse_reference_time(raw) {
                Some(time) => self.document.header.reference_time = Some(time),
                None => {
                    let kind = WarningKind::MalformedValue {
                        key: standard::REFERENCE_TIME.to_string(),
                        raw: raw.clone(),
                    };
                    self.warn(AcmiWarning::new(kind).at_line(line_no));
                }
            }
        }

        self.document.header.globals.extend(properties);
    }

    fn update(&mut self, line_no: usize, id: &str, mut properties: RawProperties) {
        let i = match self.index.get(id) {
            Some(&i) => i,
            None => {
                let i = self.document.objects.len();
                self.index.insert(id.to_string(), i);
                self.document.objects.push(AcmiObject {
                    id: id.to_string(),
                    created_at: self.current_time,
                    removed_at: None,
                    snapshots: Vec::new(),
                });
                self.accumulators.push(Accumulator::default());
                i
            }
        };

        if self.document.objects[i].removed_at.is_some() {
            let warning = AcmiWarning::new(WarningKind::UpdateAfterRemoval);
            self.warn(warning.at_line(line_no).for_object(id));
            return;
        }

        let mut malformed = Vec::new();
        let accumulator = &mut self.accumulators[i];
        if let Some(raw) = properties.remove(standard::TRANSFORM) {
            malformed = accumulator.transform.apply(&raw);
        }
        for (key, value) in properties {
            // 空値は累積状態からの削除
            if value.is_empty() {
                accumulator.properties.remove(&key);
            } else {
                accumulator.properties.insert(key, value);
            }
        }

        let snapshot = Snapshot {
            time: self.current_time,
            frame: self.current_frame,
            transform: accumulator.transform,
            properties: accumulator.properties.clone(),
        };
        let snapshots = &mut self.document.objects[i].snapshots;
        if accumulator.last_frame == Some(self.current_frame) {
            if let Some(last) = snapshots.last_mut() {
                *last = snapshot;
            }
        } else {
            snapshots.push(snapshot);
        }
        accumulator.last_frame = Some(self.current_frame);

        for (index, raw) in malformed {
            self.warn(
                AcmiWarning::new(WarningKind::MalformedTransform { index, raw })
                    .at_line(line_no)
                    .for_object(id),
            );
        }
    }

    fn finish(mut self) -> Outcome<AcmiDocument> {
        if self.document.header.file_type.is_none() {
            self.warn(AcmiWarning::new(WarningKind::MissingHeader));
        }
        Outcome::new(self.document, self.warnings)
    }
}

/// `ReferenceTime` の解釈（RFC 3339、タイムゾーン省略時はUTC）
pub fn parse_reference_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(time) = DateTime::parse_from_rfc3339(raw) {
        return Some(time.with_timezone(&Utc));
    }
    let naive = raw.trim_end_matches('Z');
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(naive, format).ok())
        .map(|time| time.and_utc())
}
