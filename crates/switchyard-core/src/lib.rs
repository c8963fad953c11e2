//! switchyard-core
//!
//! Core building blocks for the Switchyard task dispatcher.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, agent, message, errors, events）
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator, Executor, ResultSink, EventSink, MessageHandler）
//! - **impls**: 実装（BroadcastEventSink, MemoryResultSink など）
//! - **retry**: バックオフ計算
//! - **queue**: 優先度付きタスクキュー
//! - **balancer**: エージェント登録・負荷分散・ヘルス管理
//! - **client**: キャッシュ + 同時実行数制限 + リトライ
//! - **bus**: 優先度付きメッセージバス
//! - **app**: ディスパッチャ（builder, dispatch loop, delivery loop, status）
//! - **config**: TOML 設定

pub mod app;
pub mod balancer;
pub mod bus;
pub mod client;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod queue;
pub mod retry;

pub use app::{BuildError, DispatchStatus, Dispatcher, DispatcherBuilder, DispatcherHandle};
pub use config::{ConfigError, SwitchyardConfig};
