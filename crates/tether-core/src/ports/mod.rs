//! Ports - 抽象化レイヤー
//!
//! 言語ごとの実装（`impls`）とアプリケーション層（`app`）の境界です。

pub mod runtime_handler;
pub mod signals;

pub use self::runtime_handler::{
    BuildInput, BuildResult, RuntimeFamily, RuntimeHandler, StartWorkerInput,
};
pub use self::signals::{WorkerSignal, WorkerSignals};
