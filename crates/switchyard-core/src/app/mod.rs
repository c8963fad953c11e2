//! App - アプリケーション層
//!
//! このモジュールは、コンポーネントを組み合わせてディスパッチャを実装します。
//!
//! # 主要コンポーネント
//! - **DispatcherBuilder**: 構築とワイヤリング（起動時検証つき）
//! - **Dispatcher**: 制御面（Enqueue / Cancel / GetStatus / RegisterAgent / Send）
//! - **DispatchLoop**: タスク配送ループ（next→select→assign→execute→report）
//! - **DeliveryLoop**: メッセージバスの配送ループ
//! - **DispatchStatus**: GetStatus のスナップショット

pub mod builder;
mod delivery_loop;
mod dispatch_loop;
pub mod dispatcher;
pub mod status;

pub use self::builder::{BuildError, DispatcherBuilder};
pub use self::dispatcher::{Dispatcher, DispatcherHandle};
pub use self::status::DispatchStatus;
