//! # acmi-bridge
//!
//! 強化学習の飛行エピソードと ACMI（Tacview テキスト形式）の相互変換ライブラリ。
//!
//! ## モジュール構成
//!
//! - `acmi`: 座標変換、CAMスキーマ、パーサー、ライター、コンバーター
//! - `models`: エピソードモデルと基本データ型
//! - `store`: エピソードストア（JSON Lines）
//! - `service`: CLIから使う取り込み・書き出し処理
//! - `config`: YAML設定
//! - `simulation`: デモ軌跡の生成
//! - `logging`: tracing によるログ初期化

pub mod acmi;
pub mod config;
pub mod logging;
pub mod models;
pub mod service;
pub mod simulation;
pub mod store;
