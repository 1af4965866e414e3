//! Lazy lookup of modules by what they export.
//!
//! Plugins usually need a module that may not have been executed yet.
//! [`LazyModuleResolver::find`] answers from the modules already loaded, or
//! parks the request until a module satisfying the filter shows up.

use crate::module::{ModuleExports, ModuleId};
use crate::rewrite::replacer::panic_message;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::oneshot;

pub type FilterFn = Arc<dyn Fn(&ModuleId, &ModuleExports) -> bool + Send + Sync>;

/// Predicate over a loaded module's exports.
#[derive(Clone)]
pub struct Filter {
    description: String,
    f: FilterFn,
}

impl Filter {
    pub fn new<F>(description: impl Into<String>, f: F) -> Self
    where
        F: Fn(&ModuleId, &ModuleExports) -> bool + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            f: Arc::new(f),
        }
    }

    /// Module exports every one of `props`.
    pub fn by_props(props: &[&str]) -> Self {
        let props: Vec<String> = props.iter().map(|p| p.to_string()).collect();
        Self::new(format!("props {props:?}"), move |_, exports| {
            props.iter().all(|p| exports.contains(p))
        })
    }

    /// Some single export's source contains every fragment.
    pub fn by_code(fragments: &[&str]) -> Self {
        let fragments: Vec<String> = fragments.iter().map(|f| f.to_string()).collect();
        Self::new(format!("code {fragments:?}"), move |_, exports| {
            exports
                .iter()
                .any(|(_, value)| fragments.iter().all(|f| value.source.contains(f.as_str())))
        })
    }

    /// Export `name` is the literal `value`.
    pub fn by_literal(name: &str, value: serde_json::Value) -> Self {
        let name = name.to_string();
        Self::new(format!("literal {name} == {value}"), move |_, exports| {
            exports
                .get(&name)
                .and_then(|v| v.literal.as_ref())
                .is_some_and(|lit| *lit == value)
        })
    }

    pub fn by_id(id: impl Into<ModuleId>) -> Self {
        let id = id.into();
        Self::new(format!("id {id}"), move |candidate, _| *candidate == id)
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Evaluate the filter, turning a panic into an error message.
    pub fn test(&self, id: &ModuleId, exports: &ModuleExports) -> Result<bool, String> {
        catch_unwind(AssertUnwindSafe(|| (self.f)(id, exports)))
            .map_err(|payload| panic_message(payload.as_ref()))
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Filter").field(&self.description).finish()
    }
}

#[derive(Debug, Clone)]
pub struct Found {
    pub id: ModuleId,
    pub exports: Arc<ModuleExports>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("find was cancelled")]
    Cancelled,

    #[error("resolver was cleared before a module matched")]
    Closed,
}

/// Identifies a pending find for [`LazyModuleResolver::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FindHandle(u64);

/// Future side of a find. Dropping it abandons the request.
#[derive(Debug)]
pub struct PendingFind {
    rx: oneshot::Receiver<Result<Found, ResolveError>>,
}

impl Future for PendingFind {
    type Output = Result<Found, ResolveError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ResolveError::Closed)))
    }
}

struct Waiter {
    handle: FindHandle,
    filter: Filter,
    tx: oneshot::Sender<Result<Found, ResolveError>>,
}

#[derive(Default)]
pub struct LazyModuleResolver {
    loaded: Vec<Found>,
    waiters: Vec<Waiter>,
    next_handle: u64,
}

impl LazyModuleResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the first module matching `filter`, now or once it loads.
    pub fn find(&mut self, filter: Filter) -> (FindHandle, PendingFind) {
        let handle = FindHandle(self.next_handle);
        self.next_handle += 1;
        let (tx, rx) = oneshot::channel();

        match self.find_now(&filter) {
            Some(found) => {
                let _ = tx.send(Ok(found));
            }
            None => {
                tracing::debug!(filter = %filter.description(), "find parked until a matching module loads");
                self.waiters.push(Waiter { handle, filter, tx });
            }
        }
        (handle, PendingFind { rx })
    }

    /// First already-loaded module matching `filter`, in load order.
    pub fn find_now(&self, filter: &Filter) -> Option<Found> {
        self.loaded.iter().find_map(|found| {
            match filter.test(&found.id, &found.exports) {
                Ok(true) => Some(found.clone()),
                Ok(false) => None,
                Err(panic) => {
                    tracing::warn!(module = %found.id, filter = %filter.description(), "filter panicked: {panic}");
                    None
                }
            }
        })
    }

    /// Abandon a pending find; its future resolves to [`ResolveError::Cancelled`].
    /// Returns false if the find already resolved.
    pub fn cancel(&mut self, handle: FindHandle) -> bool {
        let Some(pos) = self.waiters.iter().position(|w| w.handle == handle) else {
            return false;
        };
        let waiter = self.waiters.remove(pos);
        let _ = waiter.tx.send(Err(ResolveError::Cancelled));
        true
    }

    /// Index a freshly executed module and resolve any waiters it satisfies.
    pub fn on_module_loaded(&mut self, id: ModuleId, exports: Arc<ModuleExports>) {
        let found = Found { id, exports };
        let waiters = std::mem::take(&mut self.waiters);

        for waiter in waiters {
            if waiter.tx.is_closed() {
                continue;
            }
            match waiter.filter.test(&found.id, &found.exports) {
                Ok(true) => {
                    tracing::debug!(module = %found.id, filter = %waiter.filter.description(), "pending find resolved");
                    let _ = waiter.tx.send(Ok(found.clone()));
                }
                Ok(false) => self.waiters.push(waiter),
                Err(panic) => {
                    tracing::warn!(module = %found.id, filter = %waiter.filter.description(), "filter panicked: {panic}");
                    self.waiters.push(waiter);
                }
            }
        }

        self.loaded.push(found);
    }

    /// Number of finds still waiting, excluding abandoned ones.
    pub fn pending(&self) -> usize {
        self.waiters.iter().filter(|w| !w.tx.is_closed()).count()
    }

    pub fn loaded(&self) -> usize {
        self.loaded.len()
    }

    /// Forget loaded modules and drop waiters; their futures resolve to
    /// [`ResolveError::Closed`].
    pub fn clear(&mut self) {
        self.loaded.clear();
        self.waiters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ExportValue;
    use serde_json::json;

    fn exports(names: &[&str]) -> Arc<ModuleExports> {
        let mut e = ModuleExports::new();
        for n in names {
            e.insert(*n, ExportValue::expression(format!("function {n}(){{}}")));
        }
        Arc::new(e)
    }

    #[tokio::test]
    async fn find_after_load_resolves_immediately() {
        let mut r = LazyModuleResolver::new();
        r.on_module_loaded("1".into(), exports(&["a"]));
        r.on_module_loaded("2".into(), exports(&["a", "b"]));

        let (_, pending) = r.find(Filter::by_props(&["a"]));
        assert_eq!(pending.await.unwrap().id, ModuleId::from("1"));
        assert_eq!(r.pending(), 0);
    }

    #[tokio::test]
    async fn find_before_load_resolves_on_event() {
        let mut r = LazyModuleResolver::new();
        let (_, pending) = r.find(Filter::by_props(&["b"]));
        assert_eq!(r.pending(), 1);

        r.on_module_loaded("1".into(), exports(&["a"]));
        r.on_module_loaded("2".into(), exports(&["b"]));
        r.on_module_loaded("3".into(), exports(&["b"]));

        assert_eq!(pending.await.unwrap().id, ModuleId::from("2"));
        assert_eq!(r.pending(), 0);
    }

    #[tokio::test]
    async fn cancel_resolves_with_error() {
        let mut r = LazyModuleResolver::new();
        let (handle, pending) = r.find(Filter::by_props(&["never"]));
        assert!(r.cancel(handle));
        assert!(!r.cancel(handle));
        assert_eq!(pending.await.unwrap_err(), ResolveError::Cancelled);
    }

    #[tokio::test]
    async fn dropped_waiters_are_pruned() {
        let mut r = LazyModuleResolver::new();
        let (_, pending) = r.find(Filter::by_props(&["x"]));
        drop(pending);
        assert_eq!(r.pending(), 0);
        r.on_module_loaded("1".into(), exports(&["x"]));
        assert!(r.waiters.is_empty());
    }

    #[tokio::test]
    async fn panicking_filter_keeps_waiter_pending() {
        let mut r = LazyModuleResolver::new();
        let (_, pending) = r.find(Filter::new("picky", |id, _| {
            if id.as_str() == "1" {
                panic!("bad module");
            }
            true
        }));

        r.on_module_loaded("1".into(), exports(&[]));
        assert_eq!(r.pending(), 1);
        r.on_module_loaded("2".into(), exports(&[]));
        assert_eq!(pending.await.unwrap().id, ModuleId::from("2"));
    }

    #[tokio::test]
    async fn clear_closes_waiters() {
        let mut r = LazyModuleResolver::new();
        let (_, pending) = r.find(Filter::by_id("9"));
        r.clear();
        assert_eq!(pending.await.unwrap_err(), ResolveError::Closed);
    }

    #[test]
    fn literal_and_code_filters() {
        let mut e = ModuleExports::new();
        e.insert("flag", ExportValue::literal("!0", json!(true)));
        e.insert("run", ExportValue::expression("function(){ return track(1) }"));
        let id = ModuleId::from("1");

        assert!(Filter::by_literal("flag", json!(true)).test(&id, &e).unwrap());
        assert!(!Filter::by_literal("flag", json!(false)).test(&id, &e).unwrap());
        assert!(Filter::by_code(&["track(", "return"]).test(&id, &e).unwrap());
        assert!(!Filter::by_code(&["track(", "missing"]).test(&id, &e).unwrap());
    }
}
