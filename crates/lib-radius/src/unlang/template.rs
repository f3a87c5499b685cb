use std::process::Command;

use thiserror::Error;
use tracing::warn;

use crate::request::{ListRef, Request};
use crate::types::{CastError, Value, ValueKind};
use crate::unlang::Dictionary;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Invalid attribute reference '{0}'")]
    BadAttrRef(String),

    #[error("Unknown attribute '{0}'")]
    UnknownAttr(String),

    #[error("Unterminated expansion in '{0}'")]
    Unterminated(String),

    #[error(transparent)]
    Cast(#[from] CastError),
}

/// Which instance(s) of an attribute a reference names: the first, all of
/// them (`[*]`), or the n-th (`[n]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrIndex {
    First,
    All,
    Nth(usize),
}

/// A parsed `&list:Attribute-Name[idx]` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrPath {
    pub list: ListRef,
    pub name: String,
    pub index: AttrIndex,
}

impl AttrPath {
    /// Parse the body of an attribute reference, without the leading `&`.
    pub fn parse(input: &str) -> Result<Self, TemplateError> {
        let mut rest = input;
        let mut list = ListRef::Request;

        if let Some((prefix, suffix)) = rest.split_once(':') {
            match ListRef::from_name(prefix) {
                Some(found) => {
                    list = found;
                    rest = suffix;
                }
                None => return Err(TemplateError::BadAttrRef(input.to_string())),
            }
        }

        let mut index = AttrIndex::First;
        if let Some(open) = rest.find('[') {
            let Some(stripped) = rest[open..].strip_prefix('[').and_then(|s| s.strip_suffix(']'))
            else {
                return Err(TemplateError::BadAttrRef(input.to_string()));
            };
            index = match stripped {
                "*" => AttrIndex::All,
                n => AttrIndex::Nth(
                    n.parse()
                        .map_err(|_| TemplateError::BadAttrRef(input.to_string()))?,
                ),
            };
            rest = &rest[..open];
        }

        if rest.is_empty()
            || !rest
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(TemplateError::BadAttrRef(input.to_string()));
        }

        Ok(Self {
            list,
            name: rest.to_string(),
            index,
        })
    }

    /// First matching value, taking virtual and loop variables into
    /// account.
    pub fn resolve(&self, request: &Request) -> Option<Value> {
        if let Some(value) = request.foreach_attr(&self.name) {
            return Some(value);
        }
        if let Some(value) = request.virtual_attr(&self.name) {
            return Some(value);
        }

        let list = request.list(self.list);
        match self.index {
            AttrIndex::First | AttrIndex::All => list.get(&self.name).cloned(),
            AttrIndex::Nth(n) => list.get_nth(&self.name, n).cloned(),
        }
    }

    /// Every matching value; what `foreach` iterates.
    pub fn resolve_all(&self, request: &Request) -> Vec<Value> {
        if let Some(value) = request.foreach_attr(&self.name) {
            return vec![value];
        }
        if let Some(value) = request.virtual_attr(&self.name) {
            return vec![value];
        }

        request
            .list(self.list)
            .get_all(&self.name)
            .cloned()
            .collect()
    }

    pub fn exists(&self, request: &Request) -> bool {
        self.resolve(request).is_some()
    }
}

/// One piece of a `%{...}` expansion string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XlatPart {
    Literal(String),
    Attr(AttrPath),
}

/// A value-producing expression: a literal, an attribute reference, an
/// expansion string, or a back-tick program substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Template {
    Literal(Value),
    Attr(AttrPath),
    Xlat(Vec<XlatPart>),
    Exec(String),
}

impl Template {
    pub fn parse(input: &str) -> Result<Self, TemplateError> {
        if let Some(attr) = input.strip_prefix('&') {
            return Ok(Self::Attr(AttrPath::parse(attr)?));
        }

        if let Some(stripped) = input.strip_prefix('`') {
            let program = stripped
                .strip_suffix('`')
                .ok_or_else(|| TemplateError::Unterminated(input.to_string()))?;
            return Ok(Self::Exec(program.to_string()));
        }

        let unquoted = strip_quotes(input);
        if unquoted.contains("%{") {
            return Ok(Self::Xlat(parse_xlat(unquoted)?));
        }

        Ok(Self::Literal(Value::String(unquoted.to_string())))
    }

    pub fn attr_path(&self) -> Option<&AttrPath> {
        match self {
            Self::Attr(path) => Some(path),
            _ => None,
        }
    }

    /// An `Xlat` that is exactly one `%{Attr}`, eligible for rewriting
    /// into a plain attribute reference at pass-2 time.
    pub fn single_attr_xlat(&self) -> Option<&AttrPath> {
        match self {
            Self::Xlat(parts) => match parts.as_slice() {
                [XlatPart::Attr(path)] => Some(path),
                _ => None,
            },
            _ => None,
        }
    }

    /// Evaluate to a typed value, or `None` when an attribute reference
    /// has no pair.
    pub fn evaluate(&self, request: &Request) -> Option<Value> {
        match self {
            Self::Literal(value) => Some(value.clone()),
            Self::Attr(path) => path.resolve(request),
            Self::Xlat(_) => Some(Value::String(self.expand(request))),
            Self::Exec(program) => run_program(program),
        }
    }

    /// String expansion: missing attributes expand to the empty string.
    pub fn expand(&self, request: &Request) -> String {
        match self {
            Self::Literal(value) => value.to_string(),
            Self::Attr(path) => path
                .resolve(request)
                .map(|v| v.to_string())
                .unwrap_or_default(),
            Self::Xlat(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        XlatPart::Literal(s) => out.push_str(s),
                        XlatPart::Attr(path) => {
                            if let Some(value) = path.resolve(request) {
                                out.push_str(&value.to_string());
                            }
                        }
                    }
                }
                out
            }
            Self::Exec(program) => run_program(program)
                .map(|v| v.to_string())
                .unwrap_or_default(),
        }
    }

    /// Cast a literal in place, as done for right-hand sides against the
    /// left-hand attribute's type.
    pub fn cast_in_place(&mut self, kind: ValueKind) -> Result<(), TemplateError> {
        if let Self::Literal(value) = self {
            *value = value.cast(kind)?;
        }
        Ok(())
    }

    /// Pass-2 fixup: verify attribute references against the dictionary
    /// and collapse single-attribute expansions into plain references.
    pub fn fixup(&mut self, dict: &Dictionary) -> Result<(), TemplateError> {
        if let Some(path) = self.single_attr_xlat() {
            let path = path.clone();
            *self = Self::Attr(path);
        }

        if let Self::Attr(path) = self {
            if dict.lookup(&path.name).is_none() {
                return Err(TemplateError::UnknownAttr(path.name.clone()));
            }
        }
        Ok(())
    }
}

fn strip_quotes(input: &str) -> &str {
    if input.len() >= 2 && input.starts_with('"') && input.ends_with('"') {
        &input[1..input.len() - 1]
    } else {
        input
    }
}

fn parse_xlat(input: &str) -> Result<Vec<XlatPart>, TemplateError> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut rest = input;

    while let Some(start) = rest.find("%{") {
        literal.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| TemplateError::Unterminated(input.to_string()))?;

        if !literal.is_empty() {
            parts.push(XlatPart::Literal(std::mem::take(&mut literal)));
        }
        parts.push(XlatPart::Attr(AttrPath::parse(&after[..end])?));
        rest = &after[end + 1..];
    }

    literal.push_str(rest);
    if !literal.is_empty() {
        parts.push(XlatPart::Literal(literal));
    }

    Ok(parts)
}

fn run_program(program: &str) -> Option<Value> {
    let mut words = program.split_whitespace();
    let binary = words.next()?;

    match Command::new(binary).args(words).output() {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            Some(Value::String(stdout.trim_end().to_string()))
        }
        Err(err) => {
            warn!(%program, %err, "Failed executing program expansion");
            None
        }
    }
}
