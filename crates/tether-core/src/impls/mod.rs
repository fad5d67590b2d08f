//! Impls - 言語ごとの RuntimeHandler 実装
//!
//! どの handler も子プロセスの管理は `process::ProcessTable` に任せ、
//! ビルド対象のルートは `fs::ProjectRoots` に記録して `should_rebuild` に使います。

pub mod container;
pub mod dotnet;
pub mod fs;
pub mod go;
pub mod java;
pub mod node;
pub mod process;
pub mod provided;
pub mod python;
pub mod rust;

use std::sync::Arc;
use std::time::Duration;

use crate::ports::RuntimeHandler;

pub use self::container::ContainerHandler;
pub use self::dotnet::DotnetHandler;
pub use self::go::GoHandler;
pub use self::java::JavaHandler;
pub use self::node::NodeHandler;
pub use self::provided::ProvidedHandler;
pub use self::python::PythonHandler;
pub use self::rust::RustHandler;

/// One handler per runtime family. `grace` bounds how long a stopped worker may
/// take to exit.
pub fn default_handlers(grace: Duration) -> Vec<Arc<dyn RuntimeHandler>> {
    vec![
        Arc::new(NodeHandler::new(grace)),
        Arc::new(GoHandler::new(grace)),
        Arc::new(PythonHandler::new(grace)),
        Arc::new(RustHandler::new(grace)),
        Arc::new(JavaHandler::new(grace)),
        Arc::new(DotnetHandler::new(grace)),
        Arc::new(ContainerHandler::new(grace)),
        Arc::new(ProvidedHandler::new(grace)),
    ]
}
