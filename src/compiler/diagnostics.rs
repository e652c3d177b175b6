//! Parsing of compiler output into diagnostics
//!
//! Two common shapes are recognised:
//!
//! - GNU style: `file:line:col: error: message` (column optional)
//! - MSBuild style: `file(line,col): error CODE: message`

use crate::diagnostic::{Diagnostic, Severity};
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;

fn gnu_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"^(?P<file>[^:\s][^:]*?):(?P<line>\d+):(?:(?P<col>\d+):)?\s*(?P<sev>fatal error|error|warning|note):\s*(?P<msg>.*)$",
            )
            .ok()
        })
        .as_ref()
}

fn msbuild_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"^(?P<file>.+?)\((?P<line>\d+)(?:,(?P<col>\d+))?\):\s*(?P<sev>error|warning|info)\s*(?P<code>[A-Za-z]+\d+)?\s*:\s*(?P<msg>.*)$",
            )
            .ok()
        })
        .as_ref()
}

fn severity(label: &str) -> Severity {
    match label {
        "error" | "fatal error" => Severity::Error,
        "warning" => Severity::Warning,
        _ => Severity::Info,
    }
}

/// Parse every recognisable diagnostic line in `output`
pub fn parse_diagnostics(output: &str) -> Vec<Diagnostic> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_end();
            let caps = gnu_pattern()
                .and_then(|re| re.captures(line))
                .or_else(|| msbuild_pattern().and_then(|re| re.captures(line)))?;

            Some(Diagnostic {
                severity: severity(&caps["sev"]),
                file: Some(PathBuf::from(&caps["file"])),
                line: caps["line"].parse().ok(),
                column: caps.name("col").and_then(|c| c.as_str().parse().ok()),
                code: caps.name("code").map(|c| c.as_str().to_string()),
                message: caps["msg"].to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gnu_error_with_column() {
        let diags = parse_diagnostics("/s/main.c:4:12: error: expected ';' before '}' token\n");
        assert_eq!(diags.len(), 1);
        let d = &diags[0];
        assert_eq!(d.severity, Severity::Error);
        assert_eq!(d.file.as_deref(), Some(std::path::Path::new("/s/main.c")));
        assert_eq!(d.line, Some(4));
        assert_eq!(d.column, Some(12));
        assert_eq!(d.message, "expected ';' before '}' token");
    }

    #[test]
    fn gnu_warning_without_column() {
        let diags = parse_diagnostics("util.c:7: warning: unused variable 'x'");
        assert_eq!(diags[0].severity, Severity::Warning);
        assert_eq!(diags[0].column, None);
    }

    #[test]
    fn msbuild_style_with_code() {
        let diags = parse_diagnostics(r"C:\s\main.cs(10,5): error CS1002: ; expected");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code.as_deref(), Some("CS1002"));
        assert_eq!(diags[0].line, Some(10));
        assert_eq!(diags[0].column, Some(5));
        assert_eq!(diags[0].message, "; expected");
    }

    #[test]
    fn unrelated_lines_ignored() {
        let output = "In file included from main.c:1:\n   12 |   return x\n      |          ^\ncollect2: ld returned 1 exit status\n";
        assert!(parse_diagnostics(output).is_empty());
    }
}
