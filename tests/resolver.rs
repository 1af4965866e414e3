//! Lazy module resolution against modules executed through the runtime.

use async_trait::async_trait;
use modpatch::module::{FactoryCompiler, ModuleFactory, ScriptCompiler};
use modpatch::patch::Patch;
use modpatch::plugin::Plugin;
use modpatch::resolver::{Filter, ResolveError};
use modpatch::rewrite::{Matcher, Replacement};
use modpatch::runtime::{Runtime, RuntimeConfig};
use serde_json::json;
use std::sync::Arc;

const ANALYTICS: &str = r#"function(e, t, n) { t.track = function(a) { return a }; t.version = "1.2" }"#;
const STORE: &str = r#"function(e, t, n) { t.getUser = function() { return null } }"#;

fn compiled(id: &str, source: &str) -> ModuleFactory {
    ScriptCompiler.compile(&id.into(), source).unwrap()
}

struct Bump;

#[async_trait]
impl Plugin for Bump {
    fn name(&self) -> &str {
        "Bump"
    }

    fn enabled_by_default(&self) -> bool {
        true
    }

    fn patches(&self) -> Vec<Patch> {
        vec![Patch::new("Bump", "t.track").replace(Replacement::new(
            Matcher::regex(r#"version = "[\d.]+""#).unwrap(),
            r#"version = "2.0""#,
        ))]
    }
}

#[tokio::test]
async fn find_before_load_resolves_on_first_execution() {
    let mut rt = Runtime::new(RuntimeConfig::default());
    let (_, pending) = rt.find(Filter::by_props(&["getUser"]));

    rt.define_module("1", compiled("1", ANALYTICS));
    rt.define_module("2", compiled("2", STORE));
    rt.require("1").unwrap();
    rt.require("2").unwrap();

    let found = pending.await.unwrap();
    assert_eq!(found.id.as_str(), "2");
    assert!(found.exports.contains("getUser"));
}

#[tokio::test]
async fn find_after_load_resolves_immediately() {
    let mut rt = Runtime::new(RuntimeConfig::default());
    rt.define_module("1", compiled("1", ANALYTICS));
    rt.require("1").unwrap();

    let found = rt
        .find_now(&Filter::by_literal("version", json!("1.2")))
        .unwrap();
    assert_eq!(found.id.as_str(), "1");

    let (_, pending) = rt.find(Filter::by_code(&["return a"]));
    assert_eq!(pending.await.unwrap().id.as_str(), "1");
}

#[tokio::test]
async fn resolver_sees_patched_exports() {
    let mut rt = Runtime::new(RuntimeConfig::default());
    rt.add_plugin(Arc::new(Bump)).unwrap();
    rt.start_plugins().await;

    let (_, pending) = rt.find(Filter::by_literal("version", json!("2.0")));
    rt.define_module("1", compiled("1", ANALYTICS));
    rt.require("1").unwrap();

    assert_eq!(pending.await.unwrap().id.as_str(), "1");
}

#[tokio::test]
async fn cancelled_find_never_resolves() {
    let mut rt = Runtime::new(RuntimeConfig::default());
    let (handle, pending) = rt.find(Filter::by_props(&["getUser"]));
    assert!(rt.cancel_find(handle));
    assert!(!rt.cancel_find(handle));

    rt.define_module("2", compiled("2", STORE));
    rt.require("2").unwrap();
    assert_eq!(pending.await.unwrap_err(), ResolveError::Cancelled);
}

#[tokio::test]
async fn clearing_the_runtime_closes_pending_finds() {
    let mut rt = Runtime::new(RuntimeConfig::default());
    let (_, pending) = rt.find(Filter::by_id("never"));
    rt.clear();
    assert_eq!(pending.await.unwrap_err(), ResolveError::Closed);
}
