//! Turning rewritten module source back into an executable factory.

use crate::module::factory::{ExportValue, ModuleExports, ModuleFactory, ModuleId};
use crate::module::parser::{ErrorNode, ParsedScript, ParserError};
use crate::pool;
use std::fmt;
use thiserror::Error;
use tree_sitter::Node;

/// Module bodies are function expressions; prefixing `0,` makes the parser
/// read them as an expression rather than a declaration. Statement-form
/// bodies do not survive the prefix and are parsed as-is.
const WRAP_PREFIX: &str = "0,";

/// Recompilation seam between rewritten text and a runnable factory.
pub trait FactoryCompiler: Send + Sync {
    fn compile(&self, id: &ModuleId, source: &str) -> Result<ModuleFactory, CompileError>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error(transparent)]
    Parser(#[from] ParserError),

    #[error("{} syntax error(s), first at {}", .locations.len(), first_location(.locations))]
    Syntax { locations: Vec<SyntaxLocation> },

    #[error("{0}")]
    Rejected(String),
}

fn first_location(locations: &[SyntaxLocation]) -> String {
    locations
        .first()
        .map(ToString::to_string)
        .unwrap_or_else(|| "unknown location".to_string())
}

/// 1-based position of a syntax error in the module source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntaxLocation {
    pub line: usize,
    pub column: usize,
    pub missing: bool,
}

impl SyntaxLocation {
    fn from_error_node(node: &ErrorNode) -> Self {
        let row = node.start_point.row;
        let mut column = node.start_point.column;
        if row == 0 {
            column = column.saturating_sub(WRAP_PREFIX.len());
        }
        Self {
            line: row + 1,
            column: column + 1,
            missing: node.missing,
        }
    }
}

impl fmt::Display for SyntaxLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)?;
        if self.missing {
            write!(f, " (missing token)")?;
        }
        Ok(())
    }
}

/// Default compiler for JavaScript module bodies.
///
/// Rejects text that does not parse, and otherwise yields a factory whose
/// exports are those determinable without running the code:
/// `exports.x = ...`, `module.exports = {...}` and the bundler getter form
/// `require.d(exports, { x: () => ... })`, using the factory's own parameter
/// names.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptCompiler;

impl FactoryCompiler for ScriptCompiler {
    fn compile(&self, id: &ModuleId, source: &str) -> Result<ModuleFactory, CompileError> {
        let exports = analyze(source)?;
        tracing::trace!(module = %id, exports = exports.len(), "compiled module body");
        Ok(ModuleFactory::constant(source.to_string(), exports))
    }
}

/// Parse `source` and extract its static exports.
///
/// Tries the function-expression reading first, then the plain statement
/// list. When neither parses, the errors of the first reading are reported.
pub fn analyze(source: &str) -> Result<ModuleExports, CompileError> {
    let wrapped = format!("{WRAP_PREFIX}{source}");
    pool::with_parser(|parser| -> Result<ModuleExports, CompileError> {
        let parsed = parser.parse_with_source(&wrapped)?;
        if !parsed.has_errors() {
            return Ok(extract_exports(&parsed, WRAP_PREFIX.len()));
        }

        let statements = parser.parse_with_source(source)?;
        if !statements.has_errors() {
            tracing::trace!("module body parsed in statement form");
            return Ok(extract_exports(&statements, 0));
        }

        let locations = parsed
            .error_nodes()
            .iter()
            .map(SyntaxLocation::from_error_node)
            .collect();
        Err(CompileError::Syntax { locations })
    })?
}

struct Bindings<'s> {
    module: &'s str,
    exports: &'s str,
    require: &'s str,
}

/// `offset` is where the module text starts within the parsed source.
fn extract_exports(parsed: &ParsedScript<'_>, offset: usize) -> ModuleExports {
    let root = parsed.root_node();
    let mut bindings = Bindings {
        module: "module",
        exports: "exports",
        require: "require",
    };
    let mut scope = root;

    if let Some(function) = find_factory_function(root, offset) {
        let params = parameter_names(parsed, function);
        let mut names = params.into_iter();
        if let Some(Some(name)) = names.next() {
            bindings.module = name;
        }
        if let Some(Some(name)) = names.next() {
            bindings.exports = name;
        }
        if let Some(Some(name)) = names.next() {
            bindings.require = name;
        }
        if let Some(body) = function.child_by_field_name("body") {
            scope = body;
        }
    }

    let mut exports = ModuleExports::new();
    visit(parsed, scope, &bindings, &mut exports);
    exports
}

fn find_factory_function(node: Node<'_>, offset: usize) -> Option<Node<'_>> {
    if node.start_byte() > offset {
        return None;
    }
    if node.start_byte() == offset
        && matches!(
            node.kind(),
            "function_expression" | "function" | "arrow_function"
        )
    {
        return Some(node);
    }
    let mut cursor = node.walk();
    let children: Vec<Node<'_>> = node.named_children(&mut cursor).collect();
    children
        .into_iter()
        .find_map(|child| find_factory_function(child, offset))
}

fn parameter_names<'s>(parsed: &ParsedScript<'s>, function: Node<'_>) -> Vec<Option<&'s str>> {
    if let Some(single) = function.child_by_field_name("parameter") {
        return vec![Some(parsed.node_text(single))];
    }
    let Some(params) = function.child_by_field_name("parameters") else {
        return Vec::new();
    };
    let mut cursor = params.walk();
    let names = params
        .named_children(&mut cursor)
        .map(|p| (p.kind() == "identifier").then(|| parsed.node_text(p)))
        .collect();
    names
}

fn visit(parsed: &ParsedScript<'_>, node: Node<'_>, bindings: &Bindings<'_>, out: &mut ModuleExports) {
    match node.kind() {
        "assignment_expression" => record_assignment(parsed, node, bindings, out),
        "call_expression" => record_getter_definitions(parsed, node, bindings, out),
        _ => {}
    }

    let mut cursor = node.walk();
    let children: Vec<Node<'_>> = node.named_children(&mut cursor).collect();
    for child in children {
        visit(parsed, child, bindings, out);
    }
}

fn record_assignment(
    parsed: &ParsedScript<'_>,
    node: Node<'_>,
    bindings: &Bindings<'_>,
    out: &mut ModuleExports,
) {
    let (Some(left), Some(right)) = (
        node.child_by_field_name("left"),
        node.child_by_field_name("right"),
    ) else {
        return;
    };

    if let Some(name) = export_target(parsed, left, bindings) {
        out.insert(name, export_value(parsed, right));
    } else if is_module_exports(parsed, left, bindings) {
        if right.kind() == "object" {
            record_object(parsed, right, false, out);
        } else {
            out.insert("default", export_value(parsed, right));
        }
    }
}

fn record_getter_definitions(
    parsed: &ParsedScript<'_>,
    node: Node<'_>,
    bindings: &Bindings<'_>,
    out: &mut ModuleExports,
) {
    let Some(callee) = node.child_by_field_name("function") else {
        return;
    };
    if callee.kind() != "member_expression" {
        return;
    }
    let is_define = callee
        .child_by_field_name("object")
        .is_some_and(|o| o.kind() == "identifier" && parsed.node_text(o) == bindings.require)
        && callee
            .child_by_field_name("property")
            .is_some_and(|p| parsed.node_text(p) == "d");
    if !is_define {
        return;
    }

    let Some(arguments) = node.child_by_field_name("arguments") else {
        return;
    };
    let mut cursor = arguments.walk();
    let args: Vec<Node<'_>> = arguments.named_children(&mut cursor).collect();
    if let [target, definitions, ..] = args.as_slice() {
        if is_identifier(parsed, *target, bindings.exports) && definitions.kind() == "object" {
            record_object(parsed, *definitions, true, out);
        }
    }
}

/// Name assigned by `exports.name = ...`, `exports["name"] = ...` or
/// `module.exports.name = ...`.
fn export_target(parsed: &ParsedScript<'_>, left: Node<'_>, bindings: &Bindings<'_>) -> Option<String> {
    let object = left.child_by_field_name("object")?;
    let targets_exports =
        is_identifier(parsed, object, bindings.exports) || is_module_exports(parsed, object, bindings);
    if !targets_exports {
        return None;
    }
    match left.kind() {
        "member_expression" => left
            .child_by_field_name("property")
            .map(|p| parsed.node_text(p).to_string()),
        "subscript_expression" => left
            .child_by_field_name("index")
            .filter(|i| i.kind() == "string")
            .map(|i| unquote(parsed.node_text(i)).to_string()),
        _ => None,
    }
}

fn is_module_exports(parsed: &ParsedScript<'_>, node: Node<'_>, bindings: &Bindings<'_>) -> bool {
    node.kind() == "member_expression"
        && node
            .child_by_field_name("object")
            .is_some_and(|o| is_identifier(parsed, o, bindings.module))
        && node
            .child_by_field_name("property")
            .is_some_and(|p| parsed.node_text(p) == "exports")
}

fn is_identifier(parsed: &ParsedScript<'_>, node: Node<'_>, name: &str) -> bool {
    node.kind() == "identifier" && parsed.node_text(node) == name
}

fn record_object(parsed: &ParsedScript<'_>, object: Node<'_>, getters: bool, out: &mut ModuleExports) {
    let mut cursor = object.walk();
    let members: Vec<Node<'_>> = object.named_children(&mut cursor).collect();
    for member in members {
        match member.kind() {
            "pair" => {
                let (Some(key), Some(mut value)) = (
                    member.child_by_field_name("key"),
                    member.child_by_field_name("value"),
                ) else {
                    continue;
                };
                let Some(name) = property_key(parsed, key) else {
                    continue;
                };
                if getters && value.kind() == "arrow_function" {
                    if let Some(body) = value.child_by_field_name("body") {
                        if body.kind() != "statement_block" {
                            value = body;
                        }
                    }
                }
                out.insert(name, export_value(parsed, value));
            }
            "shorthand_property_identifier" => {
                let name = parsed.node_text(member);
                out.insert(name, ExportValue::expression(name));
            }
            "method_definition" => {
                if let Some(name) = member
                    .child_by_field_name("name")
                    .and_then(|k| property_key(parsed, k))
                {
                    out.insert(name, ExportValue::expression(parsed.node_text(member)));
                }
            }
            _ => {}
        }
    }
}

fn property_key(parsed: &ParsedScript<'_>, key: Node<'_>) -> Option<String> {
    let text = parsed.node_text(key);
    match key.kind() {
        "property_identifier" | "number" => Some(text.to_string()),
        "string" => Some(unquote(text).to_string()),
        _ => None,
    }
}

fn export_value(parsed: &ParsedScript<'_>, node: Node<'_>) -> ExportValue {
    let source = parsed.node_text(node);
    match literal_value(parsed, node) {
        Some(value) => ExportValue::literal(source, value),
        None => ExportValue::expression(source),
    }
}

fn literal_value(parsed: &ParsedScript<'_>, node: Node<'_>) -> Option<serde_json::Value> {
    let text = parsed.node_text(node);
    match node.kind() {
        "string" => Some(serde_json::Value::String(unquote(text).to_string())),
        "number" => number_value(text),
        "true" => Some(serde_json::Value::Bool(true)),
        "false" => Some(serde_json::Value::Bool(false)),
        "null" => Some(serde_json::Value::Null),
        "parenthesized_expression" => node
            .named_child(0)
            .and_then(|inner| literal_value(parsed, inner)),
        // Minified booleans: `!0` and `!1`.
        "unary_expression" => {
            let operator = node.child_by_field_name("operator")?;
            let argument = node.child_by_field_name("argument")?;
            if parsed.node_text(operator) != "!" || argument.kind() != "number" {
                return None;
            }
            match parsed.node_text(argument) {
                "0" => Some(serde_json::Value::Bool(true)),
                "1" => Some(serde_json::Value::Bool(false)),
                _ => None,
            }
        }
        _ => None,
    }
}

fn number_value(text: &str) -> Option<serde_json::Value> {
    if let Ok(int) = text.parse::<i64>() {
        return Some(serde_json::Value::from(int));
    }
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(serde_json::Value::Number)
}

fn unquote(text: &str) -> &str {
    if text.len() >= 2 {
        &text[1..text.len() - 1]
    } else {
        text
    }
}
