// エラーと警告
pub mod error;

// 測地座標変換
pub mod geo;

// プロパティ値・キースキーマ・書式化
pub mod property;

// CAM（Agent.* 拡張キー）エンコーダ/デコーダ
pub mod cam;

// ACMIテキスト → ドキュメント
pub mod parser;

// エピソード → ACMIテキスト
pub mod writer;

// ドキュメント ⇔ エピソード
pub mod converter;

// 便利な re-export
pub use converter::{AcmiConverter, ImportedEpisodes};
pub use error::{AcmiError, AcmiWarning, Outcome, WarningKind};
pub use geo::{GeoPoint, EDWARDS_AFB};
pub use parser::{AcmiDocument, AcmiParser};
pub use writer::{AcmiWriter, UpdateEncoding, WriterOptions};
