//! Domain model (ids, descriptors, artifacts, invocations, events, errors).

pub mod artifact;
pub mod errors;
pub mod events;
pub mod function;
pub mod ids;
pub mod invocation;

pub use self::artifact::{BuildArtifact, BuildMode};
pub use self::errors::TetherError;
pub use self::events::{Event, EventKind};
pub use self::function::{
    Architecture, BuildProps, CopyFile, FunctionCatalog, FunctionDescriptor, NodeFormat,
};
pub use self::ids::{FunctionId, RequestId, WorkerId};
pub use self::invocation::{Invocation, InvocationContext, InvocationError, InvocationOutcome};
