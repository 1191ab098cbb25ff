/// Source Validator and Function Extractor
///
/// **Core Responsibility:**
/// Decide, without executing anything, whether a submission may enter a sandbox,
/// and find the single function the grader will call.
///
/// **Rules:**
/// - Source must fit the configured size ceiling
/// - Source must parse as a Python module
/// - No `import` / `from ... import` at any nesting depth
/// - No names that reach the module loader or interpreter internals
/// - Exactly one top-level function, callable with one positional argument
///
/// Detection works on the syntax tree and token stream, so a string literal
/// containing the word "import" is not a violation.

use gauntlet_common::types::{RunError, RunErrorKind};
use rustpython_parser::ast::{self, ExceptHandler, Stmt};
use rustpython_parser::lexer::lex;
use rustpython_parser::{Mode, Parse, Tok};
use thiserror::Error;

/// Names that reach module loading, interpreter internals or reflection
const FORBIDDEN_NAMES: &[&str] = &[
    "__import__",
    "importlib",
    "__builtins__",
    "__loader__",
    "__spec__",
    "__subclasses__",
    "__globals__",
    "__self__",
    "__class__",
    "__bases__",
    "__base__",
    "__mro__",
    "__dict__",
    "getattr",
    "setattr",
    "delattr",
    "vars",
    "globals",
    "locals",
];

/// Dunder attributes a solution may still reach with `.name`
const ALLOWED_DUNDER_ATTRIBUTES: &[&str] = &["__init__", "__name__"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceRejection {
    #[error("source is {size} bytes, limit is {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    #[error("syntax error at line {line}, column {column}: {message}")]
    Syntax {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("imports are not allowed in solutions (`{construct}` at line {line})")]
    Import { construct: String, line: usize },

    #[error("`{name}` is not allowed in solutions (line {line})")]
    Forbidden { name: String, line: usize },

    #[error("{0}")]
    FunctionNotFound(String),
}

impl SourceRejection {
    pub fn kind(&self) -> RunErrorKind {
        match self {
            SourceRejection::TooLarge { .. } => RunErrorKind::SourceTooLarge,
            SourceRejection::Syntax { .. } => RunErrorKind::SyntaxError,
            SourceRejection::Import { .. } | SourceRejection::Forbidden { .. } => RunErrorKind::ImportDisallowed,
            SourceRejection::FunctionNotFound(_) => RunErrorKind::FunctionNotFound,
        }
    }
}

impl From<SourceRejection> for RunError {
    fn from(rejection: SourceRejection) -> Self {
        RunError::new(rejection.kind(), rejection.to_string())
    }
}

/// Source that parsed and passed the import policy
#[derive(Debug)]
pub struct ValidatedSource<'a> {
    text: &'a str,
    suite: Vec<Stmt>,
}

impl<'a> ValidatedSource<'a> {
    pub fn text(&self) -> &'a str {
        self.text
    }
}

/// The single function the grader invokes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub name: String,
    pub params: Vec<String>,
}

/// Validated source plus the function bound inside it; everything a runtime needs
#[derive(Debug, Clone)]
pub struct Program {
    pub source: String,
    pub entry: EntryPoint,
}

pub fn validate(source: &str, max_source_bytes: usize) -> Result<ValidatedSource<'_>, SourceRejection> {
    if source.len() > max_source_bytes {
        return Err(SourceRejection::TooLarge {
            size: source.len(),
            limit: max_source_bytes,
        });
    }

    let suite = ast::Suite::parse(source, "<submission>").map_err(|err| {
        let (line, column) = line_col(source, u32::from(err.offset) as usize);
        SourceRejection::Syntax {
            line,
            column,
            message: err.error.to_string(),
        }
    })?;

    if let Some((construct, offset)) = find_import(&suite) {
        return Err(SourceRejection::Import {
            construct: construct.to_string(),
            line: line_col(source, offset).0,
        });
    }

    let mut after_dot = false;
    for (tok, range) in lex(source, Mode::Module).flatten() {
        match &tok {
            Tok::Comment(_) | Tok::NonLogicalNewline => continue,
            Tok::Name { name } => {
                let dunder_attribute = after_dot && is_dunder(name) && !ALLOWED_DUNDER_ATTRIBUTES.contains(&name.as_str());
                if dunder_attribute || FORBIDDEN_NAMES.contains(&name.as_str()) {
                    let name = if dunder_attribute { format!(".{}", name) } else { name.clone() };
                    return Err(SourceRejection::Forbidden {
                        name,
                        line: line_col(source, u32::from(range.start()) as usize).0,
                    });
                }
            }
            _ => {}
        }
        after_dot = matches!(tok, Tok::Dot);
    }

    Ok(ValidatedSource { text: source, suite })
}

pub fn extract(validated: &ValidatedSource<'_>) -> Result<EntryPoint, SourceRejection> {
    let mut plain = Vec::new();
    let mut async_names = Vec::new();
    for stmt in &validated.suite {
        match stmt {
            Stmt::FunctionDef(def) => plain.push(def),
            Stmt::AsyncFunctionDef(def) => async_names.push(def.name.as_str().to_string()),
            _ => {}
        }
    }

    let total = plain.len() + async_names.len();
    if total == 0 {
        return Err(SourceRejection::FunctionNotFound(
            "no top-level function definition found".to_string(),
        ));
    }
    if total > 1 {
        let mut names: Vec<String> = plain.iter().map(|d| d.name.as_str().to_string()).collect();
        names.extend(async_names);
        return Err(SourceRejection::FunctionNotFound(format!(
            "expected exactly one top-level function, found {}: {}",
            total,
            names.join(", ")
        )));
    }
    let Some(def) = plain.first() else {
        return Err(SourceRejection::FunctionNotFound(format!(
            "`async def {}` cannot be graded; define a plain function",
            async_names.join("")
        )));
    };

    let name = def.name.as_str().to_string();
    if !accepts_single_positional(&def.args) {
        return Err(SourceRejection::FunctionNotFound(format!(
            "function `{}` must accept exactly one positional argument",
            name
        )));
    }

    let params = def
        .args
        .posonlyargs
        .iter()
        .chain(def.args.args.iter())
        .map(|a| a.def.arg.as_str().to_string())
        .collect();

    Ok(EntryPoint { name, params })
}

/// Validate then extract, returning the bound program
pub fn prepare(source: &str, max_source_bytes: usize) -> Result<Program, SourceRejection> {
    let validated = validate(source, max_source_bytes)?;
    let entry = extract(&validated)?;
    Ok(Program {
        source: validated.text().to_string(),
        entry,
    })
}

fn accepts_single_positional(args: &ast::Arguments) -> bool {
    let positional: Vec<&ast::ArgWithDefault> =
        args.posonlyargs.iter().chain(args.args.iter()).collect();
    let required = positional.iter().filter(|a| a.default.is_none()).count();
    let required_kwonly = args.kwonlyargs.iter().any(|a| a.default.is_none());

    if required_kwonly || required > 1 {
        return false;
    }
    required == 1 || !positional.is_empty() || args.vararg.is_some()
}

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

fn find_import(body: &[Stmt]) -> Option<(&'static str, usize)> {
    body.iter().find_map(import_in)
}

fn import_in(stmt: &Stmt) -> Option<(&'static str, usize)> {
    match stmt {
        Stmt::Import(s) => Some(("import", u32::from(s.range.start()) as usize)),
        Stmt::ImportFrom(s) => Some(("from ... import", u32::from(s.range.start()) as usize)),
        Stmt::FunctionDef(s) => find_import(&s.body),
        Stmt::AsyncFunctionDef(s) => find_import(&s.body),
        Stmt::ClassDef(s) => find_import(&s.body),
        Stmt::If(s) => find_import(&s.body).or_else(|| find_import(&s.orelse)),
        Stmt::For(s) => find_import(&s.body).or_else(|| find_import(&s.orelse)),
        Stmt::AsyncFor(s) => find_import(&s.body).or_else(|| find_import(&s.orelse)),
        Stmt::While(s) => find_import(&s.body).or_else(|| find_import(&s.orelse)),
        Stmt::With(s) => find_import(&s.body),
        Stmt::AsyncWith(s) => find_import(&s.body),
        Stmt::Try(s) => find_import(&s.body)
            .or_else(|| handlers_import(&s.handlers))
            .or_else(|| find_import(&s.orelse))
            .or_else(|| find_import(&s.finalbody)),
        Stmt::TryStar(s) => find_import(&s.body)
            .or_else(|| handlers_import(&s.handlers))
            .or_else(|| find_import(&s.orelse))
            .or_else(|| find_import(&s.finalbody)),
        Stmt::Match(s) => s.cases.iter().find_map(|case| find_import(&case.body)),
        _ => None,
    }
}

fn handlers_import(handlers: &[ExceptHandler]) -> Option<(&'static str, usize)> {
    handlers.iter().find_map(|h| match h {
        ExceptHandler::ExceptHandler(h) => find_import(&h.body),
    })
}

/// 1-based line and column for a byte offset
fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let before = source.get(..offset).unwrap_or(source);
    let line = before.matches('\n').count() + 1;
    let column = match before.rfind('\n') {
        Some(nl) => before[nl + 1..].chars().count() + 1,
        None => before.chars().count() + 1,
    };
    (line, column)
}
