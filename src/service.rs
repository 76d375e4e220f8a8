//! # サービス層
//!
//! CLIから呼び出される取り込み・書き出し・検査処理をまとめます。
//!
//! ## 主要機能
//!
//! - `import_acmi`: 1ファイルを取り込んでストアに保存
//! - `batch_import_acmi`: ディレクトリ内のファイルを並列に取り込み
//! - `export_to_acmi`: ストアのエピソードをACMIに書き出し
//! - `inspect_acmi`: ファイル概要（オブジェクト、イベント、CAMキー）
//! - `validate_acmi`: 形式検証（致命的エラーの有無と警告）
//! - `roundtrip_acmi`: 取り込み → 書き出し → 再取り込みの確認

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::acmi::cam;
use crate::acmi::converter::{AcmiConverter, ImportedEpisodes};
use crate::acmi::error::{AcmiError, AcmiWarning, Outcome};
use crate::acmi::geo::GeoPoint;
use crate::acmi::parser::AcmiParser;
use crate::acmi::property::standard;
use crate::acmi::writer::WriterOptions;
use crate::config::ToolConfig;
use crate::models::episode::{FlightDataPoint, FlightEpisode};
use crate::models::traits::IEpisodeStore;
use crate::store::{EpisodeSummary, JsonlEpisodeStore, StoreError};

/// サービス層のエラー
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Acmi(#[from] AcmiError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("入出力エラー {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ファイルパターンが不正です: {0}")]
    Pattern(String),

    #[error("並列処理エラー: {0}")]
    Runtime(String),
}

/// 取り込みオプション
#[derive(Debug, Clone, PartialEq)]
pub struct ImportOptions {
    pub run_name: String,
    /// agent_id の接頭辞（既に付いていれば付けない、空なら付けない）
    pub agent_prefix: String,
    /// 固定の基準点
    pub reference_point: Option<GeoPoint>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self::from_config(&ToolConfig::default())
    }
}

impl ImportOptions {
    pub fn from_config(config: &ToolConfig) -> Self {
        Self {
            run_name: config.import.run_name.clone(),
            agent_prefix: config.import.agent_prefix.clone(),
            reference_point: config.reference,
        }
    }

    fn apply_prefix(&self, agent_id: &str) -> String {
        if self.agent_prefix.is_empty() || agent_id.starts_with(&self.agent_prefix) {
            agent_id.to_string()
        } else {
            format!("{}_{}", self.agent_prefix, agent_id)
        }
    }
}

/// 1ファイルの取り込み結果
#[derive(Debug, Clone)]
pub struct ImportReport {
    pub file: PathBuf,
    pub run_name: String,
    pub episodes: Vec<EpisodeSummary>,
    pub reference_point: GeoPoint,
    pub warnings: Vec<AcmiWarning>,
}

/// バッチ取り込みの1ファイル分
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub file: PathBuf,
    /// 成功時の取り込み結果
    pub report: Option<ImportReport>,
    /// 失敗時のエラーメッセージ
    pub error: Option<String>,
}

/// バッチ取り込み結果
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub entries: Vec<BatchEntry>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.entries.iter().filter(|e| e.report.is_some()).count()
    }

    pub fn failed(&self) -> usize {
        self.entries.iter().filter(|e| e.error.is_some()).count()
    }

    pub fn total_episodes(&self) -> usize {
        self.entries
            .iter()
            .filter_map(|e| e.report.as_ref())
            .map(|r| r.episodes.len())
            .sum()
    }
}

/// ファイル内オブジェクトの概要
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSummary {
    pub id: String,
    pub name: Option<String>,
    pub snapshots: usize,
    pub duration: f64,
    pub removed_at: Option<f64>,
}

/// ファイル概要（info）
#[derive(Debug, Clone)]
pub struct AcmiSummary {
    pub file: PathBuf,
    pub file_type: Option<String>,
    pub file_version: Option<String>,
    pub reference_time: Option<DateTime<Utc>>,
    pub globals: Vec<(String, String)>,
    pub frames: usize,
    pub time_span: Option<(f64, f64)>,
    pub objects: Vec<ObjectSummary>,
    /// (時刻, 種別, メッセージ)
    pub events: Vec<(f64, String, String)>,
    /// 検出された `Agent.*` キー
    pub cam_keys: BTreeSet<String>,
    pub warnings: Vec<AcmiWarning>,
}

/// 検証結果（validate）
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub file: PathBuf,
    /// 致命的エラー（あれば不合格）
    pub error: Option<String>,
    pub objects: usize,
    pub events: usize,
    pub episodes: usize,
    pub warnings: Vec<AcmiWarning>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

/// ラウンドトリップ結果（convert）
#[derive(Debug, Clone)]
pub struct RoundtripReport {
    pub input: PathBuf,
    pub output: PathBuf,
    pub episodes: usize,
    /// 再取り込み時に一致しなかった項目
    pub mismatches: Vec<String>,
    pub kept: bool,
}

impl RoundtripReport {
    pub fn verified(&self) -> bool {
        self.mismatches.is_empty()
    }
}

fn import_episodes(
    file: &Path,
    options: &ImportOptions,
) -> Result<Outcome<ImportedEpisodes>, AcmiError> {
    AcmiConverter::new(options.reference_point).import_file(file)
}

fn store_episodes(
    store: &mut JsonlEpisodeStore,
    file: &Path,
    options: &ImportOptions,
    outcome: Outcome<ImportedEpisodes>,
    mut rename: impl FnMut(&mut FlightEpisode),
) -> Result<ImportReport, ServiceError> {
    let mut summaries = Vec::with_capacity(outcome.value.episodes.len());
    for mut episode in outcome.value.episodes {
        episode.agent_id = options.apply_prefix(&episode.agent_id);
        rename(&mut episode);
        store.append(&options.run_name, &episode)?;
        summaries.push(EpisodeSummary::from(&episode));
    }

    Ok(ImportReport {
        file: file.to_path_buf(),
        run_name: options.run_name.clone(),
        episodes: summaries,
        reference_point: outcome.value.reference_point,
        warnings: outcome.warnings,
    })
}

/// 1ファイルを取り込んでストアに保存
pub fn import_acmi(
    file: &Path,
    output_dir: &Path,
    options: &ImportOptions,
) -> Result<ImportReport, ServiceError> {
    info!(
        file = %file.display(),
        output = %output_dir.display(),
        run = %options.run_name,
        "IMPORT_START: ACMIファイルを取り込みます"
    );

    let outcome = import_episodes(file, options)?;
    let mut store = JsonlEpisodeStore::new(output_dir);
    let report = store_episodes(&mut store, file, options, outcome, |_| {})?;

    info!(
        file = %file.display(),
        episodes = report.episodes.len(),
        warnings = report.warnings.len(),
        "IMPORT_DONE: 取り込み完了"
    );
    Ok(report)
}

/// ACMI拡張子を除いたファイル名（`run.1.txt.acmi` → `run.1`）
fn file_label(path: &Path) -> String {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    match name.strip_suffix(".txt.acmi").or_else(|| name.strip_suffix(".acmi")) {
        Some(stem) => stem.to_string(),
        None => path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or(name),
    }
}

/// 未使用のIDを確保して `seen` に登録
///
/// 衝突時は `<id>@<label>`、それも使用済みなら `<id>@<label>#2`, `#3`, ... とします。
fn claim_id(seen: &mut HashSet<String>, id: &str, label: &str) -> String {
    let mut candidate = id.to_string();
    let mut attempt = 1u64;
    while seen.contains(&candidate) {
        candidate = match attempt {
            1 => format!("{}@{}", id, label),
            n => format!("{}@{}#{}", id, label, n),
        };
        attempt += 1;
    }
    seen.insert(candidate.clone());
    candidate
}

/// ディレクトリ内のファイルを並列に取り込み
///
/// 解析は tokio の blocking スレッドで並列に行い、保存と agent_id の
/// 重複解消はファイル名順に逐次行います。既出の agent_id（または
/// episode_id）は `claim_id` で `<id>@<ファイル名>` に変更します。
/// 1ファイルの失敗は他のファイルに影響しません。
pub fn batch_import_acmi(
    dir: &Path,
    output_dir: &Path,
    pattern: &str,
    workers: usize,
    options: &ImportOptions,
) -> Result<BatchReport, ServiceError> {
    let query = dir.join(pattern);
    let query = query.to_string_lossy();
    let mut files: Vec<PathBuf> = glob::glob(&query)
        .map_err(|e| ServiceError::Pattern(e.to_string()))?
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .collect();
    files.sort();

    info!(
        dir = %dir.display(),
        pattern = %pattern,
        files = files.len(),
        workers = workers,
        "BATCH_IMPORT_START: バッチ取り込みを開始します"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers.max(1))
        .max_blocking_threads(workers.max(1))
        .build()
        .map_err(|e| ServiceError::Runtime(e.to_string()))?;

    type FileResult = (PathBuf, Result<Outcome<ImportedEpisodes>, String>);
    let results: Vec<FileResult> = runtime.block_on(async {
        let handles: Vec<_> = files
            .iter()
            .cloned()
            .map(|file| {
                let options = options.clone();
                let task = tokio::task::spawn_blocking({
                    let file = file.clone();
                    move || import_episodes(&file, &options)
                });
                (file, task)
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (file, task) in handles {
            let result = match task.await {
                Ok(Ok(outcome)) => Ok(outcome),
                Ok(Err(e)) => Err(e.to_string()),
                Err(e) => Err(format!("タスク異常終了: {}", e)),
            };
            results.push((file, result));
        }
        results
    });

    let mut store = JsonlEpisodeStore::new(output_dir);
    let mut seen_agents: HashSet<String> = HashSet::new();
    let mut seen_episodes: HashSet<String> = HashSet::new();
    let mut report = BatchReport::default();

    for (file, result) in results {
        let entry = match result {
            Ok(outcome) => {
                let label = file_label(&file);
                // ストアは episode_id で後勝ちのため、エピソードIDも同様に変更する
                let rename = |episode: &mut FlightEpisode| {
                    episode.agent_id = claim_id(&mut seen_agents, &episode.agent_id, &label);
                    episode.episode_id = claim_id(&mut seen_episodes, &episode.episode_id, &label);
                };
                match store_episodes(&mut store, &file, options, outcome, rename) {
                    Ok(imported) => BatchEntry { file, report: Some(imported), error: None },
                    Err(e) => BatchEntry { file, report: None, error: Some(e.to_string()) },
                }
            }
            Err(message) => {
                error!(
                    file = %file.display(),
                    error = %message,
                    "BATCH_IMPORT_FAILED: ファイルの取り込みに失敗しました"
                );
                BatchEntry { file, report: None, error: Some(message) }
            }
        };
        report.entries.push(entry);
    }

    info!(
        succeeded = report.succeeded(),
        failed = report.failed(),
        episodes = report.total_episodes(),
        "BATCH_IMPORT_DONE: バッチ取り込み完了"
    );
    Ok(report)
}

/// ストアのエピソードをACMIファイルに書き出し
///
/// `episode_id` を省略するとラン内の全エピソードを1ファイルに書き出します。
///
/// # 戻り値
///
/// 書き出したエピソード数
pub fn export_to_acmi(
    store_dir: &Path,
    output_file: &Path,
    run: &str,
    episode_id: Option<&str>,
    options: &WriterOptions,
) -> Result<usize, ServiceError> {
    let store = JsonlEpisodeStore::new(store_dir);
    let runs = store.runs()?;
    if !runs.iter().any(|r| r == run) {
        let message = format!("run '{}' (保存済みのラン: [{}])", run, runs.join(", "));
        return Err(StoreError::NotFound(message).into());
    }

    let episodes: Vec<FlightEpisode> = match episode_id {
        Some(id) => match store.load(run, id)? {
            Some(episode) => vec![episode],
            None => {
                let message = format!("episode '{}' in run '{}'", id, run);
                return Err(StoreError::NotFound(message).into());
            }
        },
        None => store.load_all(run)?,
    };

    // 逆行した軌跡はライター側で時刻順に並べ替えられる
    for episode in &episodes {
        if let Err(message) = episode.validate() {
            warn!(run = %run, "EXPORT_UNSORTED: {}", message);
        }
    }

    if let Some(parent) = output_file.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|source| ServiceError::Io { path: parent.to_path_buf(), source })?;
    }

    let converter = AcmiConverter::new(options.reference_point);
    converter.episodes_to_acmi(&episodes, output_file, options)?;
    info!(
        run = %run,
        output = %output_file.display(),
        episodes = episodes.len(),
        "EXPORT_DONE: ACMIに書き出しました"
    );
    Ok(episodes.len())
}

/// ファイル概要を取得
pub fn inspect_acmi(file: &Path) -> Result<AcmiSummary, ServiceError> {
    let outcome = AcmiParser::new().parse_file(file)?;
    let document = outcome.value;

    let objects = document
        .objects
        .iter()
        .map(|object| {
            let duration = match (object.snapshots.first(), object.snapshots.last()) {
                (Some(first), Some(last)) => last.time - first.time,
                _ => 0.0,
            };
            ObjectSummary {
                id: object.id.clone(),
                name: object
                    .snapshots
                    .last()
                    .and_then(|s| s.properties.get(standard::NAME).cloned()),
                snapshots: object.snapshots.len(),
                duration,
                removed_at: object.removed_at,
            }
        })
        .collect();

    let cam_keys = document
        .objects
        .iter()
        .flat_map(|o| o.snapshots.iter().flat_map(|s| s.properties.keys()))
        .chain(document.header.globals.keys())
        .filter(|k| cam::kind_of(k).is_some())
        .cloned()
        .collect();

    Ok(AcmiSummary {
        file: file.to_path_buf(),
        file_type: document.header.file_type.clone(),
        file_version: document.header.file_version.clone(),
        reference_time: document.header.reference_time,
        globals: document.header.globals.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        frames: document.frame_count,
        time_span: document.time_span(),
        objects,
        events: document
            .events
            .iter()
            .map(|e| (e.time, e.event_type.clone(), e.message.clone()))
            .collect(),
        cam_keys,
        warnings: outcome.warnings,
    })
}

/// 形式を検証
///
/// 入出力エラー以外の致命的エラーはレポートの `error` に格納され、
/// 呼び出し側は `passed()` で合否を判定します。
pub fn validate_acmi(file: &Path) -> Result<ValidationReport, ServiceError> {
    let mut report = ValidationReport {
        file: file.to_path_buf(),
        error: None,
        objects: 0,
        events: 0,
        episodes: 0,
        warnings: Vec::new(),
    };

    let parsed = match AcmiParser::new().parse_file(file) {
        Ok(parsed) => parsed,
        Err(e @ AcmiError::Io { .. }) => return Err(e.into()),
        Err(e) => {
            warn!(file = %file.display(), error = %e, "VALIDATE_FAILED: 検証に失敗しました");
            report.error = Some(e.to_string());
            return Ok(report);
        }
    };

    report.objects = parsed.value.objects.len();
    report.events = parsed.value.events.len();
    report.warnings = parsed.warnings;

    let converted = AcmiConverter::default().acmi_to_episodes(&parsed.value);
    report.episodes = converted.value.episodes.len();
    report.warnings.extend(converted.warnings);

    info!(
        file = %file.display(),
        objects = report.objects,
        warnings = report.warnings.len(),
        "VALIDATE_DONE: 検証完了"
    );
    Ok(report)
}

/// `flight.txt.acmi` → `flight.roundtrip.txt.acmi`
fn roundtrip_path(input: &Path) -> PathBuf {
    let name = input.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let stem = name
        .strip_suffix(".txt.acmi")
        .or_else(|| name.strip_suffix(".acmi"))
        .unwrap_or(&name);
    input.with_file_name(format!("{}.roundtrip.txt.acmi", stem))
}

/// 取り込み → 書き出し → 再取り込みを行い、一致を確認
pub fn roundtrip_acmi(
    input: &Path,
    keep: bool,
    options: &WriterOptions,
) -> Result<RoundtripReport, ServiceError> {
    let converter = AcmiConverter::default();
    let imported = converter.import_file(input)?.value;
    let output = roundtrip_path(input);

    let mut writer_options = options.clone();
    writer_options.reference_point = Some(imported.reference_point);
    converter.episodes_to_acmi(&imported.episodes, &output, &writer_options)?;

    let reimported = converter.import_file(&output)?.value;
    let mismatches = compare_episodes(&imported.episodes, &reimported.episodes);
    for mismatch in &mismatches {
        warn!(
            file = %input.display(),
            mismatch = %mismatch,
            "ROUNDTRIP_MISMATCH: 再取り込み結果が一致しません"
        );
    }

    if !keep {
        std::fs::remove_file(&output)
            .map_err(|source| ServiceError::Io { path: output.clone(), source })?;
    }

    Ok(RoundtripReport {
        input: input.to_path_buf(),
        output,
        episodes: imported.episodes.len(),
        mismatches,
        kept: keep,
    })
}

/// 位置は1e-3m、その他は識別情報と件数で比較
fn compare_episodes(before: &[FlightEpisode], after: &[FlightEpisode]) -> Vec<String> {
    let mut mismatches = Vec::new();
    if before.len() != after.len() {
        mismatches.push(format!("エピソード数: {} → {}", before.len(), after.len()));
        return mismatches;
    }

    for (a, b) in before.iter().zip(after) {
        if a.agent_id != b.agent_id || a.episode_id != b.episode_id {
            mismatches.push(format!(
                "ID: {}/{} → {}/{}",
                a.agent_id, a.episode_id, b.agent_id, b.episode_id
            ));
        }
        let (n, m) = (a.trajectory.len(), b.trajectory.len());
        if n != m {
            mismatches.push(format!("{}: データ点数 {} → {}", a.agent_id, n, m));
            continue;
        }
        let drift = a
            .trajectory
            .iter()
            .zip(&b.trajectory)
            .map(|(p, q)| p.position.distance_3d(&q.position))
            .fold(0.0, f64::max);
        if drift > 1e-3 {
            mismatches.push(format!("{}: 位置ずれ最大 {:.6}m", a.agent_id, drift));
        }
        let metrics_differ = a
            .trajectory
            .iter()
            .zip(&b.trajectory)
            .any(|(p, q)| p.rl_metrics != q.rl_metrics && !has_action_gap(p));
        if metrics_differ {
            mismatches.push(format!("{}: 強化学習メトリクスが一致しません", a.agent_id));
        }
    }
    mismatches
}

/// 欠番の行動成分（NaN）は等値比較できない
fn has_action_gap(point: &FlightDataPoint) -> bool {
    point.rl_metrics.action.iter().any(|v| v.is_nan())
}
