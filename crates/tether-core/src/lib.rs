//! tether-core
//!
//! Local Lambda runtime emulation and build orchestration.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, function, artifact, invocation, events, errors）
//! - **context**: Reactive Context Substrate（スロット + 依存追跡つきメモ）
//! - **bus**: Event Bus（コンポーネント間の唯一の通知経路）
//! - **ports**: 抽象化レイヤー（RuntimeHandler, WorkerSignals）
//! - **app**: アプリケーションロジック（registry, builder, workers, server, session, config）
//! - **impls**: 言語ごとの RuntimeHandler 実装と子プロセス管理

pub mod domain;
pub mod context;
pub mod bus;
pub mod ports;
pub mod app;
pub mod impls;
