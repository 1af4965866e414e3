//! Module factories and their interception.
//!
//! The host hands every module factory to [`ModuleInterceptor::intercept`]
//! before running it. Factories carry their source text so patches can be
//! applied to it, and [`FactoryCompiler`] turns patched text back into a
//! factory.

pub mod compile;
pub mod factory;
pub mod interceptor;
pub mod parser;

pub use compile::{CompileError, FactoryCompiler, ScriptCompiler, SyntaxLocation};
pub use factory::{ExportValue, FactoryError, ModuleExports, ModuleFactory, ModuleId};
pub use interceptor::{
    DiagnosticKind, Intercepted, ModuleInterceptor, ModuleLoaded, ModuleRecord, ModuleState,
    PatchDiagnostic, StartupFatal, DEFAULT_SELF_REF_ROOT,
};
pub use parser::{ParserError, ScriptParser};
