//! Patch pipeline behavior across registry, interceptor and compiler.

use modpatch::find::FindCriterion;
use modpatch::module::{
    CompileError, DiagnosticKind, FactoryCompiler, ModuleExports, ModuleFactory, ModuleId,
    ModuleInterceptor, ModuleState, ScriptCompiler,
};
use modpatch::patch::{Patch, PatchRegistry};
use modpatch::rewrite::{apply, Matcher, ReplaceContext, ReplaceError, Replacement};
use modpatch::settings::SettingsSnapshot;
use proptest::prelude::*;
use std::sync::Arc;

/// Accepts any text except sources containing `BROKEN`.
struct TextCompiler;

impl FactoryCompiler for TextCompiler {
    fn compile(&self, _id: &ModuleId, source: &str) -> Result<ModuleFactory, CompileError> {
        if source.contains("BROKEN") {
            return Err(CompileError::Rejected("marker found".to_string()));
        }
        Ok(ModuleFactory::constant(source, ModuleExports::new()))
    }
}

fn literal(find: &str, replace: &str) -> Replacement {
    Replacement::new(Matcher::literal(find).unwrap(), replace)
}

fn interceptor() -> ModuleInterceptor {
    ModuleInterceptor::new(Arc::new(TextCompiler))
}

fn host(source: &str) -> ModuleFactory {
    ModuleFactory::constant(source, ModuleExports::new())
}

proptest! {
    #[test]
    fn matching_is_idempotent(text in "[ab ]{0,24}", needle in "[ab]{1,3}") {
        let matcher = Matcher::literal(needle.clone()).unwrap();
        let first = matcher.find_first(&text);
        prop_assert_eq!(&first, &matcher.find_first(&text));
        prop_assert_eq!(matcher.find_all(&text), matcher.find_all(&text));
        prop_assert_eq!(first.is_some(), text.contains(needle.as_str()));
    }

    #[test]
    fn find_gate_is_pure_substring_test(
        text in "[ab. ]{0,24}",
        first in "[ab.]{1,3}",
        second in "[ab.]{1,3}",
    ) {
        let single = FindCriterion::literal(first.clone());
        let expected = text.contains(first.as_str());
        prop_assert_eq!(single.matches(&text), expected);
        prop_assert_eq!(single.matches(&text), single.matches(&text));

        let both = FindCriterion::markers([first.clone(), second.clone()]);
        let expected = text.contains(first.as_str()) && text.contains(second.as_str());
        prop_assert_eq!(both.matches(&text), expected);
        prop_assert_eq!(both.matches(&text), both.matches(&text));
    }

    #[test]
    fn replacements_compose_in_order(
        text in "[ab ]{0,24}",
        f1 in "[ab]{1,2}",
        r1 in "[abc]{0,2}",
        f2 in "[bc]{1,2}",
        r2 in "[abc]{0,2}",
    ) {
        let settings = SettingsSnapshot::default();
        let ctx = ReplaceContext { settings: &settings, plugin: "P", self_ref: None };

        let both = apply(&text, &[literal(&f1, &r1), literal(&f2, &r2)], &ctx);
        let step1 = apply(&text, &[literal(&f1, &r1)], &ctx);
        let step2 = apply(&step1.result, &[literal(&f2, &r2)], &ctx);
        prop_assert_eq!(both.result, step2.result);
    }
}

#[test]
fn end_to_end_two_patches_compose() {
    let mut registry = PatchRegistry::new();
    let a = registry
        .register(Patch::new("A", "foo").replace(literal("foo", "bar")))
        .unwrap();
    let b = registry
        .register(Patch::new("B", "foo").replace(literal("bar", "baz")))
        .unwrap();

    let mut interceptor = interceptor();
    let out = interceptor.intercept(
        "m".into(),
        host("xfoox"),
        &mut registry,
        &SettingsSnapshot::default(),
    );

    assert_eq!(out.factory.source(), "xbazx");
    assert!(out.event.patched);
    assert_eq!(out.event.patch_ids, vec![a, b]);
    assert_eq!(out.event.plugins, vec!["A".to_string(), "B".to_string()]);

    let record = interceptor.record(&"m".into()).unwrap();
    assert_eq!(
        record.history,
        vec![
            ModuleState::Registered,
            ModuleState::Matched,
            ModuleState::Patched,
            ModuleState::Stored
        ]
    );
}

#[test]
fn registration_order_decides_outcome() {
    let mut registry = PatchRegistry::new();
    registry
        .register(Patch::new("B", "foo").replace(literal("bar", "baz")))
        .unwrap();
    registry
        .register(Patch::new("A", "foo").replace(literal("foo", "bar")))
        .unwrap();

    let mut interceptor = interceptor();
    let out = interceptor.intercept(
        "m".into(),
        host("xfoox"),
        &mut registry,
        &SettingsSnapshot::default(),
    );
    // B runs first and finds nothing to rename.
    assert_eq!(out.factory.source(), "xbarx");
    assert_eq!(out.event.plugins, vec!["A".to_string()]);
}

#[test]
fn global_and_first_only_substitution() {
    let settings = SettingsSnapshot::default();
    let ctx = ReplaceContext {
        settings: &settings,
        plugin: "P",
        self_ref: None,
    };
    let first = apply("ab ab ab", &[literal("ab", "X")], &ctx);
    assert_eq!(first.result, "X ab ab");

    let all = apply("ab ab ab", &[literal("ab", "X").global()], &ctx);
    assert_eq!(all.result, "X X X");
}

#[test]
fn failing_patch_is_isolated() {
    let mut registry = PatchRegistry::new();
    registry
        .register(
            Patch::new("Thrower", "foo").replace(Replacement::with_fn(
                Matcher::literal("foo").unwrap(),
                |_| Err(ReplaceError::msg("nope")),
            )),
        )
        .unwrap();
    let good = registry
        .register(Patch::new("Good", "foo").replace(literal("foo", "ok")))
        .unwrap();

    let mut interceptor = interceptor();
    let settings = SettingsSnapshot::default();
    let out = interceptor.intercept("1".into(), host("foo()"), &mut registry, &settings);
    assert_eq!(out.factory.source(), "ok()");
    assert_eq!(out.event.patch_ids, vec![good]);
    assert_eq!(out.event.errors.len(), 1);

    // Unrelated modules are untouched.
    let other = interceptor.intercept("2".into(), host("bar()"), &mut registry, &settings);
    assert!(!other.event.patched);
    assert!(other.event.errors.is_empty());
}

#[test]
fn recompile_failure_keeps_original_factory() {
    let mut registry = PatchRegistry::new();
    registry
        .register(Patch::new("Breaker", "render").replace(literal("render()", "render(")))
        .unwrap();

    let mut interceptor = ModuleInterceptor::new(Arc::new(ScriptCompiler));
    let original = ModuleFactory::new("function(e, t) { t.x = render() }", || {
        Ok(ModuleExports::new())
    });
    let out = interceptor.intercept(
        "9".into(),
        original.clone(),
        &mut registry,
        &SettingsSnapshot::default(),
    );

    assert!(out.factory.ptr_eq(&original));
    assert!(out.factory.invoke().is_ok());
    let record = interceptor.record(&"9".into()).unwrap();
    assert_eq!(record.state, ModuleState::Stored);
    assert!(record.history.contains(&ModuleState::PatchFailed));
    assert!(record
        .diagnostics
        .iter()
        .any(|d| matches!(d.kind, DiagnosticKind::Recompile(_))));
}

#[test]
fn statement_form_module_is_patched() {
    let mut registry = PatchRegistry::new();
    registry
        .register(Patch::new("Flags", "exports.beta").replace(literal("!1", "!0")))
        .unwrap();

    let mut interceptor = ModuleInterceptor::new(Arc::new(ScriptCompiler));
    let out = interceptor.intercept(
        "flags".into(),
        host("var on = 1; exports.beta = !1"),
        &mut registry,
        &SettingsSnapshot::default(),
    );

    assert!(out.event.patched);
    assert!(out.event.errors.is_empty());
    let exports = out.factory.invoke().unwrap();
    assert_eq!(exports.get("beta").unwrap().literal, Some(serde_json::json!(true)));
}

#[test]
fn recompile_failure_reverts_only_that_patch() {
    let mut registry = PatchRegistry::new();
    let first = registry
        .register(Patch::new("A", "foo").replace(literal("foo", "bar")))
        .unwrap();
    registry
        .register(Patch::new("B", "foo").replace(literal("bar", "BROKEN")))
        .unwrap();
    let third = registry
        .register(Patch::new("C", "foo").replace(literal("x", "y")))
        .unwrap();

    let mut interceptor = interceptor();
    let out = interceptor.intercept(
        "m".into(),
        host("xfoo"),
        &mut registry,
        &SettingsSnapshot::default(),
    );
    assert_eq!(out.factory.source(), "ybar");
    assert_eq!(out.event.patch_ids, vec![first, third]);
}

#[test]
fn group_patch_reverts_on_any_miss() {
    let mut registry = PatchRegistry::new();
    registry
        .register(
            Patch::new("G", "foo")
                .group()
                .replace(literal("foo", "bar"))
                .replace(literal("missing", "x")),
        )
        .unwrap();

    let mut interceptor = interceptor();
    let out = interceptor.intercept(
        "m".into(),
        host("foo"),
        &mut registry,
        &SettingsSnapshot::default(),
    );
    assert_eq!(out.factory.source(), "foo");
    assert!(!out.event.patched);
    let record = interceptor.record(&"m".into()).unwrap();
    assert!(record
        .diagnostics
        .iter()
        .any(|d| d.kind == DiagnosticKind::GroupReverted));
}

#[test]
fn find_once_patch_is_consumed_after_first_module() {
    let mut registry = PatchRegistry::new();
    let once = registry
        .register(Patch::new("Once", "foo").replace(literal("foo", "bar")))
        .unwrap();
    let every = registry
        .register(Patch::new("Every", "foo").all().replace(literal("foo", "baz")))
        .unwrap();

    let mut interceptor = interceptor();
    let settings = SettingsSnapshot::default();
    let first = interceptor.intercept("1".into(), host("foo foo"), &mut registry, &settings);
    assert_eq!(first.factory.source(), "bar baz");
    assert!(registry.is_consumed(once));

    let second = interceptor.intercept("2".into(), host("foo"), &mut registry, &settings);
    assert_eq!(second.factory.source(), "baz");
    assert_eq!(second.event.patch_ids, vec![every]);
}

#[test]
fn self_reference_expands_to_plugin_expression() {
    let mut registry = PatchRegistry::new();
    registry
        .register(Patch::new("Greeter", "hello()").replace(literal("hello()", "$self.hello()")))
        .unwrap();

    let mut interceptor = interceptor().with_self_ref_root("Host.plugins");
    let out = interceptor.intercept(
        "m".into(),
        host("hello()"),
        &mut registry,
        &SettingsSnapshot::default(),
    );
    assert_eq!(out.factory.source(), r#"Host.plugins["Greeter"].hello()"#);
}

#[test]
fn structural_replacement_through_interceptor() {
    let mut registry = PatchRegistry::new();
    registry
        .register(Patch::new("Quiet", "console.log").replace(
            Replacement::new(Matcher::structural("console.log($MSG)").unwrap(), "void 0").global(),
        ))
        .unwrap();

    let mut interceptor = ModuleInterceptor::new(Arc::new(ScriptCompiler));
    let out = interceptor.intercept(
        "s".into(),
        ModuleFactory::constant(
            "(function(e, t) { console.log(1); t.a = 2; console.log(\"x\") })",
            ModuleExports::new(),
        ),
        &mut registry,
        &SettingsSnapshot::default(),
    );
    assert_eq!(
        out.factory.source(),
        "(function(e, t) { void 0; t.a = 2; void 0 })"
    );
    assert!(out.event.patched);
}
