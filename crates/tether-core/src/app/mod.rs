//! App layer - コンポーネント本体とセッション配線

pub mod builder;
pub mod config;
pub mod registry;
pub mod server;
pub mod session;
pub mod workers;

#[cfg(test)]
pub(crate) mod testing;

pub use self::builder::FunctionBuilder;
pub use self::config::Config;
pub use self::registry::{BoundFunction, CATALOG, HandlerRegistry};
pub use self::server::{LaneSnapshot, RuntimeServer, ServerOptions};
pub use self::session::Session;
pub use self::workers::{WorkerInfo, WorkerManager, WorkerState};
