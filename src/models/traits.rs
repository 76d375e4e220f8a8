use crate::models::episode::FlightEpisode;
use crate::store::{EpisodeSummary, StoreError};

/// エピソード保存先のインターフェース
///
/// エピソードは「ラン名 + エピソードID」で識別されます。
/// 変換層は保存形式に依存せず、このトレイトだけを利用します。
pub trait IEpisodeStore {
    /// エピソードを追記保存
    fn append(&mut self, run: &str, episode: &FlightEpisode) -> Result<(), StoreError>;

    /// エピソードIDで読み込み（存在しない場合は `None`）
    fn load(&self, run: &str, episode_id: &str) -> Result<Option<FlightEpisode>, StoreError>;

    /// ラン内のエピソード一覧
    fn list(&self, run: &str) -> Result<Vec<EpisodeSummary>, StoreError>;

    /// 保存済みのラン名一覧
    fn runs(&self) -> Result<Vec<String>, StoreError>;
}
