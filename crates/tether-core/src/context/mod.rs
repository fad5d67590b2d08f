//! Reactive Context Substrate
//!
//! セッション全体で共有する値の入れ物と、依存追跡つきのメモ化。
//!
//! # 構成
//! - **ContextKey<T>**: 型付きのスロット名
//! - **Context**: 値の提供（`provide` / `with`）と取得（`use_value`）
//! - **Memo<T, E>**: 初回計算で読んだスロット・メモのバージョンを記録し、
//!   どれかが置き換わったら次回の `get` で再計算する
//!
//! 暗黙のグローバル状態は持たず、`Context` を明示的に渡します。

mod graph;
mod memo;

pub use self::memo::{Memo, Reader};

use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

use self::graph::{Graph, NodeId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("context not available: {0}")]
    NotAvailable(&'static str),

    #[error("context value has an unexpected type: {0}")]
    TypeMismatch(&'static str),
}

/// Typed name of a context slot.
///
/// ```ignore
/// pub const CATALOG: ContextKey<FunctionCatalog> = ContextKey::new("functions");
/// ctx.provide(&CATALOG, catalog);
/// let catalog = ctx.use_value(&CATALOG)?;
/// ```
pub struct ContextKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ContextKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Process/session scoped value container.
#[derive(Default)]
pub struct Context {
    graph: Mutex<Graph>,
}

impl Context {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Install (or replace) a value. Every memo that read the previous value is
    /// invalidated, transitively.
    pub fn provide<T: Send + Sync + 'static>(&self, key: &ContextKey<T>, value: T) {
        let mut graph = self.graph.lock();
        let slot = graph.slot(key.name);
        graph.write_slot(slot, Some(Arc::new(value)));
    }

    /// Make `value` available for the duration of `f`, then restore what was there
    /// before. Both the install and the restore invalidate dependent memos.
    pub fn with<T, R>(&self, key: &ContextKey<T>, value: T, f: impl FnOnce(&Context) -> R) -> R
    where
        T: Send + Sync + 'static,
    {
        let previous = {
            let mut graph = self.graph.lock();
            let slot = graph.slot(key.name);
            graph.write_slot(slot, Some(Arc::new(value)))
        };
        let result = f(self);
        let mut graph = self.graph.lock();
        let slot = graph.slot(key.name);
        graph.write_slot(slot, previous);
        result
    }

    /// Current value of a slot.
    pub fn use_value<T: Send + Sync + 'static>(
        &self,
        key: &ContextKey<T>,
    ) -> Result<Arc<T>, ContextError> {
        self.read(key).map(|(value, _, _)| value)
    }

    pub fn is_provided<T>(&self, key: &ContextKey<T>) -> bool {
        let mut graph = self.graph.lock();
        let slot = graph.slot(key.name);
        graph.read_slot(slot).0.is_some()
    }

    /// Declare a memoized computation.
    pub fn memo<T, E, F>(&self, name: impl Into<String>, compute: F) -> Memo<T, E>
    where
        T: Clone + Send + Sync + 'static,
        E: From<ContextError>,
        F: Fn(&Reader<'_>) -> Result<T, E> + Send + Sync + 'static,
    {
        let id = self.graph.lock().memo(name.into());
        Memo::new(id, Arc::new(compute))
    }

    /// Reads a slot and reports which node/version was observed.
    fn read<T: Send + Sync + 'static>(
        &self,
        key: &ContextKey<T>,
    ) -> Result<(Arc<T>, NodeId, u64), ContextError> {
        let (slot, value, version) = {
            let mut graph = self.graph.lock();
            let slot = graph.slot(key.name);
            let (value, version) = graph.read_slot(slot);
            (slot, value, version)
        };
        let value = value.ok_or(ContextError::NotAvailable(key.name))?;
        let value = value
            .downcast::<T>()
            .map_err(|_| ContextError::TypeMismatch(key.name))?;
        Ok((value, slot, version))
    }

    /// Slot id and version even when the slot is empty, so that a later `provide`
    /// still invalidates memos that failed on a missing value.
    fn slot_version<T>(&self, key: &ContextKey<T>) -> (NodeId, u64) {
        let mut graph = self.graph.lock();
        let slot = graph.slot(key.name);
        (slot, graph.version(slot))
    }
}
