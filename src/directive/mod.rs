//! Build directives embedded in source comments
//!
//! A directive is a line comment of the form `//kiln_<op> args`. Arguments
//! are comma-separated items, each optionally followed by a parenthesised
//! option list. The characters `; , ( ) { }` are syntax; a doubled delimiter
//! (`((`, `,,`, ...) stands for the literal character.
//!
//! | Operator | Aliases | Meaning |
//! |----------|---------|---------|
//! | `ref` | `reference`, `r` | native library reference |
//! | `inc` | `include` | pull another source file into the unit |
//! | `pkg` | `package` | versioned package from the registry |
//! | `dir` | `probe` | extra search directory (`/**` = recursive) |
//! | `args` | `co` | raw compiler flags |
//! | `pc` | `precompiler` | transform applied before scanning |

mod scanner;

pub use scanner::{scan, split_words};

use crate::diagnostic::Diagnostic;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix that marks a directive line
pub const PREFIX: &str = "//kiln_";

/// Characters with syntactic meaning inside directive arguments
pub const DELIMITERS: [char; 6] = [';', ',', '(', ')', '{', '}'];

/// Directive operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveKind {
    Reference,
    Include,
    Package,
    ProbingDir,
    CompilerArgs,
    Precompiler,
}

impl DirectiveKind {
    /// Look up an operator by name or alias
    pub fn from_op(op: &str) -> Option<Self> {
        match op {
            "ref" | "reference" | "r" => Some(Self::Reference),
            "inc" | "include" => Some(Self::Include),
            "pkg" | "package" => Some(Self::Package),
            "dir" | "probe" => Some(Self::ProbingDir),
            "args" | "co" => Some(Self::CompilerArgs),
            "pc" | "precompiler" => Some(Self::Precompiler),
            _ => None,
        }
    }

    /// Options an item of this kind may carry
    fn allowed_options(&self) -> &'static [&'static str] {
        match self {
            Self::Include => &["optional"],
            _ => &[],
        }
    }
}

impl fmt::Display for DirectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Reference => "ref",
            Self::Include => "inc",
            Self::Package => "pkg",
            Self::ProbingDir => "dir",
            Self::CompilerArgs => "args",
            Self::Precompiler => "pc",
        };
        write!(f, "{}", name)
    }
}

/// One comma-separated argument of a directive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectiveItem {
    pub value: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl DirectiveItem {
    pub fn has_option(&self, option: &str) -> bool {
        self.options.iter().any(|o| o == option)
    }
}

/// A parsed directive line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    pub kind: DirectiveKind,
    /// Argument text with escapes resolved, trailing `;` comment removed
    pub raw: String,
    pub items: Vec<DirectiveItem>,
    /// 1-based line number
    pub line: usize,
}

impl Directive {
    /// Package name and optional version requirement of an item
    pub fn package_spec(item: &DirectiveItem) -> (String, Option<String>) {
        let mut words = item.value.split_whitespace();
        let name = words.next().unwrap_or_default().to_string();
        let version = words.next().map(str::to_string);
        (name, version)
    }
}

/// One `OP(args)` line inside a `/* kiln_<name> ... */` block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroInvocation {
    pub table: String,
    pub op: String,
    pub args: Vec<String>,
    pub line: usize,
}

/// Everything the scanner extracted from one source text
#[derive(Debug, Clone, Default)]
pub struct ScanOutput {
    pub directives: Vec<Directive>,
    pub macros: Vec<MacroInvocation>,
    /// Warnings for skipped malformed lines (no file attached)
    pub diagnostics: Vec<Diagnostic>,
}

impl ScanOutput {
    /// Directives of one kind, in line order
    pub fn of_kind(&self, kind: DirectiveKind) -> impl Iterator<Item = &Directive> {
        self.directives.iter().filter(move |d| d.kind == kind)
    }
}
