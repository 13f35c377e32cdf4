//! CSS-like model stylesheets binding model/provider/effort to nodes.
//!
//! Selectors, in increasing specificity: `*` < bare shape name (`box`) <
//! `.class` < `#id`. Declarations use `:` or `=` between property and value
//! and `;` between declarations. Recognized properties: `llm_model` (alias
//! `model`), `llm_provider`, `reasoning_effort`.

use orrery_types::OrreryError;

use crate::graph::{PipelineGraph, PipelineNode};

#[derive(Debug, Clone, PartialEq)]
pub struct Stylesheet {
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub selector: Selector,
    pub declarations: Vec<Declaration>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    Universal,
    Shape(String),
    Class(String),
    Id(String),
}

impl Selector {
    pub fn specificity(&self) -> u8 {
        match self {
            Selector::Universal => 0,
            Selector::Shape(_) => 1,
            Selector::Class(_) => 2,
            Selector::Id(_) => 3,
        }
    }

    pub fn matches(&self, node: &PipelineNode) -> bool {
        match self {
            Selector::Universal => true,
            Selector::Shape(shape) => node.shape == *shape,
            Selector::Class(class) => node.classes.contains(class),
            Selector::Id(id) => node.id == *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub property: Property,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    LlmModel,
    LlmProvider,
    ReasoningEffort,
}

impl Property {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "llm_model" | "model" => Some(Property::LlmModel),
            "llm_provider" => Some(Property::LlmProvider),
            "reasoning_effort" => Some(Property::ReasoningEffort),
            _ => None,
        }
    }

    fn canonical_name(&self) -> &'static str {
        match self {
            Property::LlmModel => "llm_model",
            Property::LlmProvider => "llm_provider",
            Property::ReasoningEffort => "reasoning_effort",
        }
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Scanner<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn at(&self, pattern: &str) -> bool {
        self.input.as_bytes()[self.pos..].starts_with(pattern.as_bytes())
    }

    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn skip_trivia(&mut self) {
        loop {
            while self
                .peek()
                .is_some_and(|c| c.is_ascii_whitespace())
            {
                self.bump();
            }
            if self.at("//") {
                while self.peek().is_some_and(|c| c != b'\n') {
                    self.bump();
                }
                continue;
            }
            if self.at("/*") {
                self.pos += 2;
                while self.pos < self.input.len() && !self.at("*/") {
                    self.bump();
                }
                if self.at("*/") {
                    self.pos += 2;
                }
                continue;
            }
            break;
        }
    }

    fn ident(&mut self) -> Result<String, OrreryError> {
        self.skip_trivia();
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_' || c == b'-')
        {
            self.bump();
        }
        if self.pos == start {
            return Err(self.error("expected identifier"));
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn value_text(&mut self) -> Result<String, OrreryError> {
        self.skip_trivia();
        let start = self.pos;
        while self.peek().is_some_and(|c| c != b';' && c != b'}') {
            self.bump();
        }
        let value = self.input[start..self.pos].trim();
        if value.is_empty() {
            return Err(self.error("expected property value"));
        }
        Ok(value.to_string())
    }

    fn expect(&mut self, ch: u8) -> Result<(), OrreryError> {
        self.skip_trivia();
        if self.peek() == Some(ch) {
            self.bump();
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", ch as char)))
        }
    }

    fn error(&self, message: &str) -> OrreryError {
        let consumed = &self.input.as_bytes()[..self.pos.min(self.input.len())];
        let line = consumed.iter().filter(|&&b| b == b'\n').count() + 1;
        let col = consumed
            .iter()
            .rposition(|&b| b == b'\n')
            .map(|i| self.pos - i)
            .unwrap_or(self.pos + 1);
        OrreryError::Validation(format!(
            "stylesheet parse error at line {line}, col {col}: {message}"
        ))
    }

    fn selector(&mut self) -> Result<Selector, OrreryError> {
        self.skip_trivia();
        match self.peek() {
            Some(b'*') => {
                self.bump();
                Ok(Selector::Universal)
            }
            Some(b'#') => {
                self.bump();
                Ok(Selector::Id(self.ident()?))
            }
            Some(b'.') => {
                self.bump();
                Ok(Selector::Class(self.ident()?))
            }
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => {
                Ok(Selector::Shape(self.ident()?))
            }
            _ => Err(self.error("expected selector ('*', shape, '.class', or '#id')")),
        }
    }

    fn declaration(&mut self) -> Result<Declaration, OrreryError> {
        let name = self.ident()?;
        let property = Property::parse(&name)
            .ok_or_else(|| self.error(&format!("unknown property '{name}'")))?;
        self.skip_trivia();
        match self.peek() {
            Some(b':') | Some(b'=') => self.bump(),
            _ => return Err(self.error("expected ':' or '=' after property name")),
        }
        let value = self.value_text()?;
        Ok(Declaration { property, value })
    }

    fn rule(&mut self) -> Result<Rule, OrreryError> {
        let selector = self.selector()?;
        self.expect(b'{')?;
        let mut declarations = Vec::new();
        loop {
            self.skip_trivia();
            match self.peek() {
                Some(b'}') => {
                    self.bump();
                    break;
                }
                None => return Err(self.error("unbalanced braces: missing '}'")),
                _ => {
                    declarations.push(self.declaration()?);
                    self.skip_trivia();
                    if self.peek() == Some(b';') {
                        self.bump();
                    }
                }
            }
        }
        Ok(Rule {
            selector,
            declarations,
        })
    }

    fn stylesheet(&mut self) -> Result<Stylesheet, OrreryError> {
        let mut rules = Vec::new();
        loop {
            self.skip_trivia();
            if self.pos >= self.input.len() {
                break;
            }
            rules.push(self.rule()?);
        }
        Ok(Stylesheet { rules })
    }
}

/// Parse a model stylesheet. Unknown properties and unbalanced braces are
/// validation errors.
pub fn parse_stylesheet(input: &str) -> Result<Stylesheet, OrreryError> {
    Scanner::new(input).stylesheet()
}

/// Serialize a stylesheet back to source form.
pub fn serialize_stylesheet(sheet: &Stylesheet) -> String {
    let mut out = String::new();
    for rule in &sheet.rules {
        match &rule.selector {
            Selector::Universal => out.push('*'),
            Selector::Shape(s) => out.push_str(s),
            Selector::Class(c) => {
                out.push('.');
                out.push_str(c);
            }
            Selector::Id(id) => {
                out.push('#');
                out.push_str(id);
            }
        }
        out.push_str(" { ");
        for decl in &rule.declarations {
            out.push_str(decl.property.canonical_name());
            out.push_str(": ");
            out.push_str(&decl.value);
            out.push_str("; ");
        }
        out.push_str("}\n");
    }
    out
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// Apply a stylesheet to every node of a graph.
///
/// For each node: snapshot the explicitly set model fields, clear them,
/// apply matching rules in ascending specificity (higher specificity
/// overwrites lower), then restore the snapshot. Explicit node attributes
/// always win over stylesheet values.
pub fn apply_stylesheet(graph: &mut PipelineGraph, sheet: &Stylesheet) {
    for node in graph.all_nodes_mut() {
        let explicit_model = node.llm_model.take();
        let explicit_provider = node.llm_provider.take();
        let explicit_effort = node.reasoning_effort.take();

        let mut matching: Vec<&Rule> =
            sheet.rules.iter().filter(|r| r.selector.matches(node)).collect();
        matching.sort_by_key(|r| r.selector.specificity());

        for rule in matching {
            for decl in &rule.declarations {
                let value = Some(decl.value.clone());
                match decl.property {
                    Property::LlmModel => node.llm_model = value,
                    Property::LlmProvider => node.llm_provider = value,
                    Property::ReasoningEffort => node.reasoning_effort = value,
                }
            }
        }

        if explicit_model.is_some() {
            node.llm_model = explicit_model;
        }
        if explicit_provider.is_some() {
            node.llm_provider = explicit_provider;
        }
        if explicit_effort.is_some() {
            node.reasoning_effort = explicit_effort;
        }
    }
}
