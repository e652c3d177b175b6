//! Line-oriented directive scanner

use super::{
    Directive, DirectiveItem, DirectiveKind, MacroInvocation, ScanOutput, DELIMITERS, PREFIX,
};
use crate::diagnostic::Diagnostic;

/// Prefix of a block comment that opens a macro table
const MACRO_TABLE_PREFIX: &str = "kiln_";

/// A character after escape processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Literal(char),
    Delim(char),
}

/// Split text into tokens, turning doubled delimiters into literals
fn tokenize(text: &str) -> Vec<Token> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::with_capacity(chars.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if DELIMITERS.contains(&c) {
            if chars.get(i + 1) == Some(&c) {
                tokens.push(Token::Literal(c));
                i += 2;
            } else {
                tokens.push(Token::Delim(c));
                i += 1;
            }
        } else {
            tokens.push(Token::Literal(c));
            i += 1;
        }
    }

    tokens
}

/// Render tokens back to text with escapes resolved
fn render(tokens: &[Token]) -> String {
    tokens
        .iter()
        .map(|t| match t {
            Token::Literal(c) | Token::Delim(c) => *c,
        })
        .collect()
}

/// Split argument tokens into items with optional `(opt, ...)` suffixes
fn parse_items(tokens: &[Token]) -> Result<Vec<DirectiveItem>, String> {
    let mut items = Vec::new();
    let mut value = String::new();
    let mut options = Vec::new();
    let mut option = String::new();
    let mut in_parens = false;
    let mut closed = false;

    let mut finish = |value: &mut String, options: &mut Vec<String>| {
        let trimmed = value.trim();
        if !trimmed.is_empty() || !options.is_empty() {
            items.push(DirectiveItem {
                value: trimmed.to_string(),
                options: std::mem::take(options),
            });
        }
        value.clear();
    };

    for token in tokens {
        match *token {
            Token::Literal(c) if in_parens => option.push(c),
            Token::Literal(c) if closed => {
                if !c.is_whitespace() {
                    return Err(format!("unexpected '{}' after option list", c));
                }
            }
            Token::Literal(c) => value.push(c),
            Token::Delim(',') if in_parens => {
                push_option(&mut option, &mut options);
            }
            Token::Delim(',') => {
                finish(&mut value, &mut options);
                closed = false;
            }
            Token::Delim('(') => {
                if in_parens || closed {
                    return Err("nested option list".to_string());
                }
                in_parens = true;
            }
            Token::Delim(')') => {
                if !in_parens {
                    return Err("unmatched ')'".to_string());
                }
                push_option(&mut option, &mut options);
                in_parens = false;
                closed = true;
            }
            Token::Delim(c) => {
                return Err(format!("unescaped '{}' (write '{}{}')", c, c, c));
            }
        }
    }

    if in_parens {
        return Err("unclosed '('".to_string());
    }
    finish(&mut value, &mut options);
    Ok(items)
}

fn push_option(option: &mut String, options: &mut Vec<String>) {
    let trimmed = option.trim();
    if !trimmed.is_empty() {
        options.push(trimmed.to_string());
    }
    option.clear();
}

/// Split a command line into words, honouring single and double quotes
pub fn split_words(text: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut has_word = false;

    for c in text.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                has_word = true;
            }
            None if c.is_whitespace() => {
                if has_word {
                    words.push(std::mem::take(&mut current));
                    has_word = false;
                }
            }
            None => {
                current.push(c);
                has_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err("unterminated quote".to_string());
    }
    if has_word {
        words.push(current);
    }
    Ok(words)
}

/// Parse one directive line (already known to start with the prefix)
fn parse_directive(body: &str, line: usize) -> Result<Directive, String> {
    let op_len = body
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(body.len());
    let op = &body[..op_len];
    if op.is_empty() {
        return Err("missing directive operator".to_string());
    }
    let kind = DirectiveKind::from_op(op).ok_or_else(|| format!("unknown directive '{}'", op))?;

    let rest = body[op_len..].strip_prefix(':').unwrap_or(&body[op_len..]);
    let mut tokens = tokenize(rest);
    if let Some(end) = tokens.iter().position(|t| *t == Token::Delim(';')) {
        tokens.truncate(end);
    }
    let raw = render(&tokens).trim().to_string();
    let mut items = parse_items(&tokens)?;

    if items.is_empty() {
        return Err(format!("'{}' requires at least one argument", kind));
    }

    let allowed = kind.allowed_options();
    for item in &items {
        if let Some(bad) = item.options.iter().find(|o| !allowed.contains(&o.as_str())) {
            return Err(format!("option '{}' is not valid for '{}'", bad, kind));
        }
        if item.value.is_empty() {
            return Err(format!("'{}' has an empty argument", kind));
        }
    }

    match kind {
        DirectiveKind::Package => {
            for item in &items {
                let words = item.value.split_whitespace().count();
                if words > 2 {
                    return Err(format!(
                        "package '{}' takes a name and an optional version",
                        item.value
                    ));
                }
            }
        }
        DirectiveKind::CompilerArgs => {
            let mut argv = Vec::new();
            for item in &items {
                argv.extend(split_words(&item.value)?);
            }
            items = argv
                .into_iter()
                .map(|value| DirectiveItem {
                    value,
                    options: vec![],
                })
                .collect();
        }
        _ => {}
    }

    Ok(Directive {
        kind,
        raw,
        items,
        line,
    })
}

/// Parse `OP(args)` inside a macro table
fn parse_macro_line(text: &str, table: &str, line: usize) -> Result<MacroInvocation, String> {
    let open = text
        .find('(')
        .ok_or_else(|| format!("expected OP(args), found '{}'", text))?;
    let op = text[..open].trim();
    let valid_ident = op
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && op.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_ident {
        return Err(format!("invalid macro name '{}'", op));
    }

    let inner = text[open + 1..]
        .strip_suffix(')')
        .ok_or_else(|| format!("macro '{}' is missing ')'", op))?;

    let mut args = Vec::new();
    let mut current = String::new();
    for token in tokenize(inner) {
        match token {
            Token::Literal(c) => current.push(c),
            Token::Delim(',') => args.push(std::mem::take(&mut current).trim().to_string()),
            Token::Delim(c) => return Err(format!("unescaped '{}' in macro arguments", c)),
        }
    }
    if !current.trim().is_empty() || !args.is_empty() {
        args.push(current.trim().to_string());
    }

    Ok(MacroInvocation {
        table: table.to_string(),
        op: op.to_string(),
        args,
        line,
    })
}

/// Block comment state while walking lines
enum Block {
    None,
    Plain,
    MacroTable(String),
}

/// Scan source text for directives and macro tables.
///
/// Malformed directives never abort the scan: each one becomes a warning
/// diagnostic carrying its line number and the line is skipped.
/// Byte offset of a `/*` that opens a comment, skipping string and
/// character literals and anything after a `//` line comment
fn block_comment_start(line: &str) -> Option<usize> {
    let bytes = line.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(_) if b == b'\\' => i += 1,
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match (b, bytes.get(i + 1)) {
                (b'"' | b'\'', _) => quote = Some(b),
                (b'/', Some(b'/')) => return None,
                (b'/', Some(b'*')) => return Some(i),
                _ => {}
            },
        }
        i += 1;
    }
    None
}

pub fn scan(text: &str) -> ScanOutput {
    let mut output = ScanOutput::default();
    let mut block = Block::None;

    for (index, line) in text.lines().enumerate() {
        let line_no = index + 1;

        match &block {
            Block::Plain | Block::MacroTable(_) => {
                let (content, ends) = match line.find("*/") {
                    Some(end) => (&line[..end], true),
                    None => (line, false),
                };

                if let Block::MacroTable(table) = &block {
                    let trimmed = content.trim();
                    if !trimmed.is_empty() {
                        match parse_macro_line(trimmed, table, line_no) {
                            Ok(invocation) => output.macros.push(invocation),
                            Err(reason) => output.diagnostics.push(
                                Diagnostic::warning(format!("malformed macro: {}", reason))
                                    .with_line(line_no),
                            ),
                        }
                    }
                }

                if ends {
                    block = Block::None;
                }
                continue;
            }
            Block::None => {}
        }

        let trimmed = line.trim_start();

        if let Some(body) = trimmed.strip_prefix(PREFIX) {
            match parse_directive(body, line_no) {
                Ok(directive) => output.directives.push(directive),
                Err(reason) => output.diagnostics.push(
                    Diagnostic::warning(format!("malformed directive: {}", reason))
                        .with_line(line_no),
                ),
            }
            continue;
        }

        if trimmed.starts_with("//") {
            continue;
        }

        if let Some(start) = block_comment_start(line) {
            let after = &line[start + 2..];
            if after.contains("*/") {
                continue;
            }
            let header = after.split_whitespace().next().unwrap_or_default();
            block = match header.strip_prefix(MACRO_TABLE_PREFIX) {
                Some(name) if !name.is_empty() => Block::MacroTable(name.to_string()),
                _ => Block::Plain,
            };
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_basic_directives() {
        let text = "//kiln_inc util.c, more.c\n//kiln_ref m\nint main() {}\n";
        let out = scan(text);

        assert_eq!(out.directives.len(), 2);
        assert_eq!(out.directives[0].kind, DirectiveKind::Include);
        assert_eq!(out.directives[0].line, 1);
        let values: Vec<_> = out.directives[0].items.iter().map(|i| &i.value).collect();
        assert_eq!(values, vec!["util.c", "more.c"]);
        assert_eq!(out.directives[1].kind, DirectiveKind::Reference);
        assert!(out.diagnostics.is_empty());
    }

    #[test]
    fn doubled_delimiter_is_literal() {
        let out = scan("//kiln_inc my((file)).c\n");
        assert_eq!(out.directives[0].items[0].value, "my(file).c");
        assert!(out.directives[0].items[0].options.is_empty());
        assert_eq!(out.directives[0].raw, "my(file).c");
    }

    #[test]
    fn escaped_comma_and_semicolon() {
        let out = scan("//kiln_dir a,,b;;c ; trailing comment\n");
        assert_eq!(out.directives[0].items.len(), 1);
        assert_eq!(out.directives[0].items[0].value, "a,b;c");
    }

    #[test]
    fn option_list_parsed() {
        let out = scan("//kiln_inc extra.c(optional), base.c\n");
        let items = &out.directives[0].items;
        assert_eq!(items[0].value, "extra.c");
        assert!(items[0].has_option("optional"));
        assert_eq!(items[1].value, "base.c");
    }

    #[test]
    fn colon_after_operator() {
        let out = scan("//kiln_ref:pthread\n");
        assert_eq!(out.directives[0].items[0].value, "pthread");
    }

    #[test]
    fn malformed_lines_are_skipped_with_warning() {
        let text = "//kiln_bogus x\n//kiln_inc\n//kiln_inc a(b\n//kiln_ref {x}\n//kiln_inc ok.c\n";
        let out = scan(text);

        assert_eq!(out.directives.len(), 1);
        assert_eq!(out.directives[0].items[0].value, "ok.c");
        assert_eq!(out.diagnostics.len(), 4);
        assert!(out.diagnostics.iter().all(|d| !d.is_error()));
        assert_eq!(out.diagnostics[0].line, Some(1));
        assert!(out.diagnostics[0].message.contains("unknown directive"));
    }

    #[test]
    fn option_not_allowed_for_reference() {
        let out = scan("//kiln_ref m(optional)\n");
        assert!(out.directives.is_empty());
        assert!(out.diagnostics[0].message.contains("not valid"));
    }

    #[test]
    fn package_arity_checked() {
        let out = scan("//kiln_pkg zlib 1.2, json\n//kiln_pkg a b c\n");
        assert_eq!(out.directives.len(), 1);
        assert_eq!(out.directives[0].items.len(), 2);
        assert_eq!(out.diagnostics.len(), 1);
    }

    #[test]
    fn compiler_args_split_into_words() {
        let out = scan("//kiln_args -Wall \"-DNAME=a b\", -Wl,,-rpath\n");
        let argv: Vec<_> = out.directives[0].items.iter().map(|i| i.value.as_str()).collect();
        assert_eq!(argv, vec!["-Wall", "-DNAME=a b", "-Wl,-rpath"]);
    }

    #[test]
    fn directives_in_block_comments_ignored() {
        let text = "/*\n//kiln_ref hidden\n*/\n//kiln_ref shown\n";
        let out = scan(text);
        assert_eq!(out.directives.len(), 1);
        assert_eq!(out.directives[0].items[0].value, "shown");
    }

    #[test]
    fn comment_opener_inside_string_ignored() {
        let text = "const char *g = \"src/*.c\";\n//kiln_ref m\n//kiln_inc util.c\n";
        let out = scan(text);
        assert_eq!(out.directives.len(), 2);
        assert!(out.diagnostics.is_empty());
    }

    #[test]
    fn trailing_block_comment_still_opens() {
        let text = "int x; /* note\n//kiln_inc hidden.c\n*/\n//kiln_inc seen.c\n";
        let out = scan(text);
        assert_eq!(out.directives.len(), 1);
        assert_eq!(out.directives[0].items[0].value, "seen.c");
    }

    #[test]
    fn macro_table_parsed() {
        let text = "/* kiln_exports\nEXPORT(add, int((a)))\nEXPORT(sub)\nnot a macro\n*/\n//kiln_ref m\n";
        let out = scan(text);

        assert_eq!(out.macros.len(), 2);
        assert_eq!(out.macros[0].table, "exports");
        assert_eq!(out.macros[0].op, "EXPORT");
        assert_eq!(out.macros[0].args, vec!["add", "int(a)"]);
        assert_eq!(out.macros[0].line, 2);
        assert_eq!(out.macros[1].args, vec!["sub"]);
        assert_eq!(out.diagnostics.len(), 1);
        assert_eq!(out.directives.len(), 1);
    }

    #[test]
    fn single_line_block_does_not_open_table() {
        let out = scan("/* kiln_x */\n//kiln_ref m\n");
        assert!(out.macros.is_empty());
        assert_eq!(out.directives.len(), 1);
    }

    #[test]
    fn split_words_quotes() {
        assert_eq!(
            split_words("a 'b c' \"\" d").unwrap(),
            vec!["a", "b c", "", "d"]
        );
        assert!(split_words("'open").is_err());
    }
}
