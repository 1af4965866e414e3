use ast_grep_language::{LanguageExt, SupportLang};
use thiserror::Error;
use tree_sitter::{Parser, Tree};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParserError {
    #[error("failed to set language for parser")]
    LanguageSet,

    #[error("failed to parse source code")]
    ParseFailed,
}

/// Tree-sitter parser wrapper for JavaScript module bodies.
pub struct ScriptParser {
    parser: Parser,
}

impl ScriptParser {
    pub fn new() -> Result<Self, ParserError> {
        let mut parser = Parser::new();
        let ts_lang = SupportLang::JavaScript.get_ts_language();
        parser
            .set_language(&ts_lang)
            .map_err(|_| ParserError::LanguageSet)?;
        Ok(Self { parser })
    }

    pub fn parse(&mut self, source: &str) -> Result<Tree, ParserError> {
        self.parser
            .parse(source, None)
            .ok_or(ParserError::ParseFailed)
    }

    pub fn parse_with_source<'a>(
        &mut self,
        source: &'a str,
    ) -> Result<ParsedScript<'a>, ParserError> {
        let tree = self.parse(source)?;
        Ok(ParsedScript { source, tree })
    }
}

/// A parsed script with its tree-sitter tree.
pub struct ParsedScript<'a> {
    pub source: &'a str,
    pub tree: Tree,
}

impl<'a> ParsedScript<'a> {
    pub fn root_node(&self) -> tree_sitter::Node<'_> {
        self.tree.root_node()
    }

    /// Check if the tree contains any ERROR or MISSING nodes.
    pub fn has_errors(&self) -> bool {
        self.tree.root_node().has_error()
    }

    /// All ERROR and MISSING nodes, in document order.
    pub fn error_nodes(&self) -> Vec<ErrorNode> {
        let mut errors = Vec::new();
        collect_error_nodes(self.tree.root_node(), &mut errors);
        errors
    }

    pub fn node_text(&self, node: tree_sitter::Node<'_>) -> &'a str {
        &self.source[node.byte_range()]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorNode {
    pub byte_start: usize,
    pub byte_end: usize,
    pub start_point: tree_sitter::Point,
    /// Set for nodes the parser inserted to recover (`MISSING`).
    pub missing: bool,
}

fn collect_error_nodes(node: tree_sitter::Node<'_>, errors: &mut Vec<ErrorNode>) {
    if node.is_error() || node.is_missing() {
        errors.push(ErrorNode {
            byte_start: node.start_byte(),
            byte_end: node.end_byte(),
            start_point: node.start_position(),
            missing: node.is_missing(),
        });
    }
    if !node.has_error() {
        return;
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_error_nodes(child, errors);
    }
}
