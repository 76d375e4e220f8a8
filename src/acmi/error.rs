//! # エラー型
//!
//! ACMIの解析・書き出しで使うエラーと警告を定義します。
//!
//! ## 主要機能
//!
//! - `AcmiError`: ファイル単位で致命的なエラー（入出力、時刻、行構造）
//! - `AcmiWarning` / `WarningKind`: 処理を継続できる問題（行番号とオブジェクトIDを保持）
//! - `Outcome`: 部分的に回復した結果と警告の組

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// ファイル単位で致命的なACMIエラー
///
/// 発生したファイルの解析は中断されます。バッチ処理では他ファイルに影響しません。
#[derive(Debug, Error)]
pub enum AcmiError {
    #[error("ACMIファイル入出力エラー {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{line}行目: 時刻マーカーを解釈できません: '{raw}'")]
    InvalidTimeMarker { line: usize, raw: String },

    #[error("{line}行目: 時刻が逆行しています ({previous} -> {found})")]
    NonMonotonicTime { line: usize, previous: f64, found: f64 },

    #[error("{line}行目: 行構造を解釈できません: '{content}'")]
    MalformedLine { line: usize, content: String },
}

impl AcmiError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AcmiError::Io { path: path.into(), source }
    }
}

/// 回復可能な警告の種類
#[derive(Debug, Clone, PartialEq)]
pub enum WarningKind {
    /// `T=` のサブフィールドが数値でない（直前の値を保持）
    MalformedTransform { index: usize, raw: String },
    /// 型付きキーの値を解釈できない（そのキーは未設定扱い）
    MalformedValue { key: String, raw: String },
    /// `=` を含まないプロパティ
    MalformedProperty { raw: String },
    /// `Agent.Action.<i>` の欠番（NaNで補完）
    ActionIndexGap { missing: Vec<usize> },
    /// 削除済みオブジェクトへの更新（無視）
    UpdateAfterRemoval,
    /// `FileType=` ヘッダーがない
    MissingHeader,
    /// 位置情報を一度も持たないオブジェクト（エピソード化しない）
    NoPosition,
    /// 緯度経度が妥当な範囲外（変換は継続）
    ImplausibleCoordinates { lat: f64, lon: f64, alt: f64 },
}

/// 解析・変換中に収集される警告
#[derive(Debug, Clone, PartialEq)]
pub struct AcmiWarning {
    /// 発生行（1始まり、行に紐づかない場合は `None`）
    pub line: Option<usize>,
    pub object_id: Option<String>,
    pub kind: WarningKind,
}

impl AcmiWarning {
    pub fn new(kind: WarningKind) -> Self {
        Self { line: None, object_id: None, kind }
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }

    pub fn for_object(mut self, object_id: impl Into<String>) -> Self {
        self.object_id = Some(object_id.into());
        self
    }
}

impl fmt::Display for AcmiWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(line) = self.line {
            write!(f, "{}行目: ", line)?;
        }
        if let Some(id) = &self.object_id {
            write!(f, "[{}] ", id)?;
        }
        match &self.kind {
            WarningKind::MalformedTransform { index, raw } => {
                write!(f, "T= の{}番目の値が不正です: '{}'", index, raw)
            }
            WarningKind::MalformedValue { key, raw } => {
                write!(f, "{} の値が不正です: '{}'", key, raw)
            }
            WarningKind::MalformedProperty { raw } => {
                write!(f, "key=value 形式ではありません: '{}'", raw)
            }
            WarningKind::ActionIndexGap { missing } => {
                write!(f, "Agent.Action の欠番 {:?} をNaNで補完しました", missing)
            }
            WarningKind::UpdateAfterRemoval => {
                write!(f, "削除済みオブジェクトへの更新を無視しました")
            }
            WarningKind::MissingHeader => write!(f, "FileType ヘッダーがありません"),
            WarningKind::NoPosition => {
                write!(f, "位置情報がないためエピソードに変換しません")
            }
            WarningKind::ImplausibleCoordinates { lat, lon, alt } => {
                write!(f, "座標が範囲外です ({:.6}, {:.6}, {:.1})", lat, lon, alt)
            }
        }
    }
}

/// 部分的に回復した結果と警告の組
#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub value: T,
    pub warnings: Vec<AcmiWarning>,
}

impl<T> Outcome<T> {
    pub fn new(value: T, warnings: Vec<AcmiWarning>) -> Self {
        Self { value, warnings }
    }

    /// 値を取り出し、警告を `sink` に移す
    pub fn drain_into(self, sink: &mut Vec<AcmiWarning>) -> T {
        sink.extend(self.warnings);
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_display_includes_context() {
        let kind = WarningKind::MalformedTransform { index: 2, raw: "abc".into() };
        let warning = AcmiWarning::new(kind)
            .at_line(12)
            .for_object("a01");
        let text = warning.to_string();
        assert!(text.contains("12"));
        assert!(text.contains("[a01]"));
        assert!(text.contains("abc"));
    }

    #[test]
    fn test_outcome_drain_collects_warnings() {
        let mut sink = Vec::new();
        let outcome = Outcome::new(5, vec![AcmiWarning::new(WarningKind::MissingHeader)]);
        let value = outcome.drain_into(&mut sink);
        assert_eq!(value, 5);
        assert_eq!(sink.len(), 1);
    }
}
