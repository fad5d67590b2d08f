//! Runtime handler registry.
//!
//! Design:
//! - 初期化時に `register` で handler を積む（mutable）
//! - セッション中は immutable。関数ごとの handler 選択は `bind` が Context の memo に
//!   キャッシュするので、`can_handle` の評価は関数あたり 1 回だけ
//! - 複数の handler が同じ runtime を扱える場合は登録順で先勝ち

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::context::{Context, ContextKey, Memo, Reader};
use crate::domain::{FunctionCatalog, FunctionDescriptor, FunctionId, TetherError};
use crate::ports::RuntimeHandler;

/// The function catalog of the current synth cycle. Providing a new catalog
/// invalidates every binding.
pub const CATALOG: ContextKey<FunctionCatalog> = ContextKey::new("functions");

/// A function together with the handler selected for it.
#[derive(Clone)]
pub struct BoundFunction {
    pub function: FunctionDescriptor,
    pub handler: Arc<dyn RuntimeHandler>,
}

impl fmt::Debug for BoundFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundFunction")
            .field("function_id", &self.function.function_id)
            .field("runtime", &self.function.runtime)
            .field("family", &self.handler.family())
            .finish()
    }
}

pub struct HandlerRegistry {
    ctx: Arc<Context>,
    handlers: Vec<Arc<dyn RuntimeHandler>>,
    bindings: Mutex<HashMap<FunctionId, Memo<BoundFunction, TetherError>>>,
}

impl HandlerRegistry {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            handlers: Vec::new(),
            bindings: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn RuntimeHandler>) {
        tracing::debug!(family = %handler.family(), "runtime handler registered");
        self.handlers.push(handler);
    }

    /// First registered handler whose `can_handle(runtime)` is true.
    pub fn for_runtime(&self, runtime: &str) -> Option<&Arc<dyn RuntimeHandler>> {
        self.handlers.iter().find(|h| h.can_handle(runtime))
    }

    /// The handler bound to `function_id`, resolved on first use and memoized.
    ///
    /// An unrecognized runtime is a configuration error (`UnsupportedRuntime`).
    pub fn bind(&self, function_id: &FunctionId) -> Result<BoundFunction, TetherError> {
        let memo = self
            .bindings
            .lock()
            .entry(function_id.clone())
            .or_insert_with(|| self.binding_memo(function_id.clone()))
            .clone();
        memo.get(&self.ctx)
    }

    /// Functions of the current catalog.
    pub fn catalog(&self) -> Result<Arc<FunctionCatalog>, TetherError> {
        Ok(self.ctx.use_value(&CATALOG)?)
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn binding_memo(&self, function_id: FunctionId) -> Memo<BoundFunction, TetherError> {
        let handlers = self.handlers.clone();
        self.ctx.memo(
            format!("handler:{function_id}"),
            move |r: &Reader<'_>| {
                let catalog = r.use_value(&CATALOG)?;
                let function = catalog.get(&function_id)?.clone();
                let handler = handlers
                    .iter()
                    .find(|h| h.can_handle(&function.runtime))
                    .cloned()
                    .ok_or_else(|| TetherError::UnsupportedRuntime {
                        function_id: function_id.clone(),
                        runtime: function.runtime.clone(),
                    })?;
                tracing::debug!(
                    function_id = %function_id,
                    runtime = %function.runtime,
                    family = %handler.family(),
                    "runtime handler bound"
                );
                Ok(BoundFunction { function, handler })
            },
        )
    }
}
