// 基本的なデータ型と数学ユーティリティ
pub mod common;

// エピソードモデル（軌跡、テレメトリ、強化学習メトリクス）
pub mod episode;

// 保存先インターフェース（trait）定義
pub mod traits;

// 便利な re-export
pub use common::*;
pub use episode::{FlightDataPoint, FlightEpisode, FlightEvent, RlMetrics, Telemetry};
pub use traits::*;
