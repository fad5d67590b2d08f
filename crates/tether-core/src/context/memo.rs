//! Memoized computations over a [`Context`].

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

use super::graph::{Dependency, NodeId};
use super::{Context, ContextError, ContextKey};

type Compute<T, E> = Arc<dyn Fn(&Reader<'_>) -> Result<T, E> + Send + Sync>;

/// Read handle passed to a memo computation. Every read is recorded as a
/// dependency of the memo being computed.
pub struct Reader<'a> {
    ctx: &'a Context,
    deps: RefCell<Vec<Dependency>>,
}

impl<'a> Reader<'a> {
    fn new(ctx: &'a Context) -> Self {
        Self {
            ctx,
            deps: RefCell::new(Vec::new()),
        }
    }

    pub fn use_value<T: Send + Sync + 'static>(
        &self,
        key: &ContextKey<T>,
    ) -> Result<Arc<T>, ContextError> {
        match self.ctx.read(key) {
            Ok((value, slot, version)) => {
                self.deps.borrow_mut().push((slot, version));
                Ok(value)
            }
            Err(err) => {
                self.deps.borrow_mut().push(self.ctx.slot_version(key));
                Err(err)
            }
        }
    }

    /// Read another memo; this memo is invalidated whenever that one is.
    pub fn get<T, E>(&self, memo: &Memo<T, E>) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
        E: From<ContextError>,
    {
        let value = memo.get(self.ctx)?;
        let version = self.ctx.graph.lock().version(memo.id);
        self.deps.borrow_mut().push((memo.id, version));
        Ok(value)
    }

    pub fn context(&self) -> &Context {
        self.ctx
    }

    fn into_deps(self) -> Vec<Dependency> {
        self.deps.into_inner()
    }
}

/// Handle of a memoized computation. Cheap to clone.
pub struct Memo<T, E> {
    id: NodeId,
    compute: Compute<T, E>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, E> Clone for Memo<T, E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            compute: Arc::clone(&self.compute),
            _marker: PhantomData,
        }
    }
}

impl<T, E> Memo<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: From<ContextError>,
{
    pub(super) fn new(id: NodeId, compute: Compute<T, E>) -> Self {
        Self {
            id,
            compute,
            _marker: PhantomData,
        }
    }

    /// Cached value, or compute (and cache) it. Errors are never cached.
    ///
    /// The computation runs without holding the context lock, so it may read other
    /// slots and memos freely.
    pub fn get(&self, ctx: &Context) -> Result<T, E> {
        let cached = ctx.graph.lock().fresh(self.id);
        if let Some(cached) = cached {
            return cached
                .downcast::<T>()
                .map(|value| (*value).clone())
                .map_err(|_| {
                    let name = ctx.graph.lock().name(self.id).to_string();
                    tracing::error!(memo = %name, "memo cache holds a value of the wrong type");
                    E::from(ContextError::TypeMismatch("memo"))
                });
        }

        let reader = Reader::new(ctx);
        let value = (self.compute)(&reader)?;
        let deps = reader.into_deps();
        ctx.graph
            .lock()
            .store(self.id, Arc::new(value.clone()), deps);
        Ok(value)
    }

    /// Discard the cached value (and everything derived from it).
    pub fn invalidate(&self, ctx: &Context) {
        ctx.graph.lock().invalidate(self.id);
    }

    pub fn is_cached(&self, ctx: &Context) -> bool {
        ctx.graph.lock().is_cached(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ROOT: ContextKey<String> = ContextKey::new("root");
    const UNRELATED: ContextKey<u32> = ContextKey::new("unrelated");

    fn counting_memo(ctx: &Context, calls: Arc<AtomicUsize>) -> Memo<String, ContextError> {
        ctx.memo("upper-root", move |r: &Reader<'_>| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(r.use_value(&ROOT)?.to_uppercase())
        })
    }

    #[test]
    fn memo_is_computed_once_until_dependency_changes() {
        let ctx = Context::new();
        ctx.provide(&ROOT, "app".to_string());
        let calls = Arc::new(AtomicUsize::new(0));
        let memo = counting_memo(&ctx, calls.clone());

        assert_eq!(memo.get(&ctx).unwrap(), "APP");
        assert_eq!(memo.get(&ctx).unwrap(), "APP");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        ctx.provide(&UNRELATED, 7);
        assert_eq!(memo.get(&ctx).unwrap(), "APP");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        ctx.provide(&ROOT, "web".to_string());
        assert!(!memo.is_cached(&ctx));
        assert_eq!(memo.get(&ctx).unwrap(), "WEB");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn nested_memos_invalidate_transitively() {
        let ctx = Context::new();
        ctx.provide(&ROOT, "app".to_string());
        let inner = counting_memo(&ctx, Arc::new(AtomicUsize::new(0)));
        let outer_calls = Arc::new(AtomicUsize::new(0));
        let outer = {
            let inner = inner.clone();
            let calls = outer_calls.clone();
            ctx.memo("suffixed", move |r: &Reader<'_>| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ContextError>(format!("{}-dev", r.get(&inner)?))
            })
        };

        assert_eq!(outer.get(&ctx).unwrap(), "APP-dev");
        ctx.provide(&ROOT, "web".to_string());
        assert!(!outer.is_cached(&ctx));
        assert_eq!(outer.get(&ctx).unwrap(), "WEB-dev");
        assert_eq!(outer_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn missing_value_error_is_not_cached() {
        let ctx = Context::new();
        let memo = counting_memo(&ctx, Arc::new(AtomicUsize::new(0)));

        let err = memo.get(&ctx).unwrap_err();
        assert_eq!(err, ContextError::NotAvailable("root"));

        ctx.provide(&ROOT, "late".to_string());
        assert_eq!(memo.get(&ctx).unwrap(), "LATE");
    }

    #[test]
    fn explicit_invalidation_forces_recompute() {
        let ctx = Context::new();
        ctx.provide(&ROOT, "app".to_string());
        let calls = Arc::new(AtomicUsize::new(0));
        let memo = counting_memo(&ctx, calls.clone());

        memo.get(&ctx).unwrap();
        memo.invalidate(&ctx);
        memo.get(&ctx).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn with_scope_invalidates_and_restores() {
        let ctx = Context::new();
        ctx.provide(&ROOT, "app".to_string());
        let memo = counting_memo(&ctx, Arc::new(AtomicUsize::new(0)));

        assert_eq!(memo.get(&ctx).unwrap(), "APP");
        let scoped = ctx.with(&ROOT, "scoped".to_string(), |ctx| memo.get(ctx).unwrap());
        assert_eq!(scoped, "SCOPED");
        assert_eq!(memo.get(&ctx).unwrap(), "APP");
    }
}
