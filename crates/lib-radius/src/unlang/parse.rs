use thiserror::Error;

use crate::unlang::{ItemAst, SectionAst};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{line}: Unbalanced '}}'")]
    UnbalancedClose { line: usize },

    #[error("Missing '}}' for section '{name}' opened at line {line}")]
    UnterminatedSection { name: String, line: usize },

    #[error("{line}: Unterminated quoted string")]
    UnterminatedString { line: usize },

    #[error("{line}: Expected 'attr = value' or 'attr op value', got '{text}'")]
    BadPair { line: usize, text: String },
}

const OPERATORS: [&str; 10] = ["!*", ":=", "+=", "-=", "=~", "!~", "==", "!=", ">=", "="];

/// Parse unlang source text into the generic section AST.
///
/// The syntax is line-oriented: a section header is `name1 [name2] {` with
/// the brace on the same line, `}` closes it, everything else is a pair or
/// a bare reference. `#` starts a comment.
pub fn parse_sections(input: &str) -> Result<Vec<SectionAst>, ParseError> {
    let mut stack: Vec<(SectionAst, usize)> = Vec::new();
    let mut roots = Vec::new();

    for (number, raw_line) in input.lines().enumerate() {
        let number = number + 1;
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        if line == "}" {
            let Some((section, _)) = stack.pop() else {
                return Err(ParseError::UnbalancedClose { line: number });
            };
            match stack.last_mut() {
                Some((parent, _)) => parent.items.push(ItemAst::Section(section)),
                None => roots.push(section),
            }
            continue;
        }

        if let Some(header) = line.strip_suffix('{') {
            let header = header.trim();
            let (name1, name2) = split_header(header);
            stack.push((SectionAst::new(name1, name2), number));
            continue;
        }

        let pair = parse_pair(line, number)?;
        match stack.last_mut() {
            Some((section, _)) => section.items.push(pair),
            None => {
                return Err(ParseError::BadPair {
                    line: number,
                    text: line.to_string(),
                })
            }
        }
    }

    if let Some((section, line)) = stack.pop() {
        return Err(ParseError::UnterminatedSection {
            name: section.name1,
            line,
        });
    }

    Ok(roots)
}

/// Parse a single section (the common case for a server block).
pub fn parse_section(input: &str) -> Result<SectionAst, ParseError> {
    let mut sections = parse_sections(input)?;
    match sections.len() {
        1 => Ok(sections.remove(0)),
        _ => Err(ParseError::BadPair {
            line: 0,
            text: "expected exactly one top-level section".to_string(),
        }),
    }
}

fn strip_comment(line: &str) -> &str {
    let mut in_quote = false;
    for (index, c) in line.char_indices() {
        match c {
            '"' => in_quote = !in_quote,
            '#' if !in_quote => return &line[..index],
            _ => {}
        }
    }
    line
}

fn split_header(header: &str) -> (String, Option<String>) {
    match header.split_once(char::is_whitespace) {
        Some((name1, rest)) => {
            let rest = rest.trim();
            let name2 = (!rest.is_empty()).then(|| rest.to_string());
            (name1.to_string(), name2)
        }
        None => (header.to_string(), None),
    }
}

fn find_outside_quotes(line: &str, needle: &str) -> Option<usize> {
    let bytes = line.as_bytes();
    let mut in_quote = false;
    for index in 0..bytes.len() {
        if bytes[index] == b'"' {
            in_quote = !in_quote;
            continue;
        }
        if !in_quote && line[index..].starts_with(needle) {
            return Some(index);
        }
    }
    None
}

fn parse_pair(line: &str, number: usize) -> Result<ItemAst, ParseError> {
    // Operators are matched as standalone words outside quotes, earliest
    // occurrence first, so quoted values survive intact.
    let mut best: Option<(usize, &'static str)> = None;
    for op in OPERATORS {
        let needle = format!(" {op} ");
        if let Some(index) = find_outside_quotes(line, &needle) {
            if best.map(|(b, _)| index < b).unwrap_or(true) {
                best = Some((index, op));
            }
        }
    }

    if let Some((index, op)) = best {
        let attr = line[..index].trim().to_string();
        let value = line[index + op.len() + 2..].trim();
        let value = (!value.is_empty()).then(|| value.to_string());
        return Ok(ItemAst::Pair {
            attr,
            op: Some(op.to_string()),
            value,
        });
    }

    // Unary wildcard delete may end the line.
    if let Some(attr) = line.strip_suffix(" !*") {
        return Ok(ItemAst::Pair {
            attr: attr.trim().to_string(),
            op: Some("!*".to_string()),
            value: None,
        });
    }

    if line.split_whitespace().count() != 1 {
        return Err(ParseError::BadPair {
            line: number,
            text: line.to_string(),
        });
    }

    Ok(ItemAst::module_ref(line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_sections() {
        let src = r#"
            authorize {
                filter_username
                if (&User-Name == "bob") {
                    reject_module
                }
                sql {
                    fail = 1
                }
            }
        "#;

        let section = parse_section(src).unwrap();
        assert_eq!(section.name1, "authorize");
        assert_eq!(section.items.len(), 3);

        match &section.items[1] {
            ItemAst::Section(sub) => {
                assert_eq!(sub.name1, "if");
                assert_eq!(sub.name2.as_deref(), Some("(&User-Name == \"bob\")"));
                assert_eq!(sub.items.len(), 1);
            }
            other => panic!("expected section, got {other:?}"),
        }

        match &section.items[2] {
            ItemAst::Section(sub) => {
                assert_eq!(sub.name1, "sql");
                assert_eq!(
                    sub.items[0],
                    ItemAst::Pair {
                        attr: "fail".into(),
                        op: Some("=".into()),
                        value: Some("1".into()),
                    }
                );
            }
            other => panic!("expected section, got {other:?}"),
        }
    }

    #[test]
    fn parses_update_ops() {
        let src = r#"
            update {
                &reply:Reply-Message := "hello"
                &Class !*
            }
        "#;

        let section = parse_section(src).unwrap();
        assert_eq!(
            section.items[0],
            ItemAst::Pair {
                attr: "&reply:Reply-Message".into(),
                op: Some(":=".into()),
                value: Some("\"hello\"".into()),
            }
        );
        assert_eq!(
            section.items[1],
            ItemAst::Pair {
                attr: "&Class".into(),
                op: Some("!*".into()),
                value: None,
            }
        );
    }

    #[test]
    fn comments_and_blank_lines_ignored() {
        let src = "authorize {\n  # a comment\n\n  ok_module # trailing\n}\n";
        let section = parse_section(src).unwrap();
        assert_eq!(section.items.len(), 1);
    }

    #[test]
    fn hash_inside_quotes_is_kept() {
        let src = "update {\n  &reply:Reply-Message := \"#1\"\n}\n";
        let section = parse_section(src).unwrap();
        match &section.items[0] {
            ItemAst::Pair { value, .. } => assert_eq!(value.as_deref(), Some("\"#1\"")),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn unbalanced_braces_error() {
        assert!(matches!(
            parse_sections("}\n"),
            Err(ParseError::UnbalancedClose { .. })
        ));
        assert!(matches!(
            parse_sections("authorize {\n"),
            Err(ParseError::UnterminatedSection { .. })
        ));
    }
}
