use regex::Regex;
use thiserror::Error;
use tracing::trace;

use crate::request::Request;
use crate::types::ValueKind;
use crate::unlang::{Dictionary, Template, TemplateError};

#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("Empty condition")]
    Empty,

    #[error("Expected {expected} at '{found}'")]
    Expected {
        expected: &'static str,
        found: String,
    },

    #[error("Unterminated {0}")]
    Unterminated(&'static str),

    #[error("Unknown cast type '{0}'")]
    UnknownCast(String),

    #[error("Invalid regular expression: {0}")]
    BadRegex(#[from] regex::Error),

    #[error("Regular expressions are only valid on the right of =~ or !~")]
    MisplacedRegex,

    #[error("Cannot compare virtual attribute {0} to another attribute")]
    VirtualAttrRhs(String),

    #[error("Cannot compare virtual attribute {0} via a regex")]
    VirtualRegex(String),

    #[error("Cannot cast virtual attribute {0}")]
    VirtualCast(String),

    #[error("Must use '==' for comparisons with virtual attribute {0}")]
    VirtualOp(String),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    RegexMatch,
    RegexNotMatch,
}

/// A compiled condition tree. Regexes are compiled at parse time; a bad
/// pattern is a fatal configuration error.
#[derive(Debug, Clone)]
pub enum Condition {
    True,
    False,
    /// Attribute existence / literal truthiness test.
    Exists(Template),
    Not(Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Compare {
        lhs: Template,
        op: CompOp,
        rhs: Template,
        cast: Option<ValueKind>,
        /// Marked at pass-2 time for virtual attributes: the comparison
        /// goes through the attribute's callback, not direct pair
        /// comparison.
        via_callback: bool,
    },
    Regex {
        lhs: Template,
        pattern: Regex,
        negated: bool,
    },
}

impl Condition {
    pub fn parse(input: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let cond = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(ConditionError::Expected {
                expected: "end of condition",
                found: parser.describe_current(),
            });
        }
        Ok(cond)
    }

    /// Compile-time constant value, if the condition has one. Used to
    /// prune always-true / always-false branches.
    pub fn constant(&self) -> Option<bool> {
        match self {
            Self::True => Some(true),
            Self::False => Some(false),
            _ => None,
        }
    }

    pub fn eval(&self, request: &Request) -> bool {
        match self {
            Self::True => true,
            Self::False => false,
            Self::Not(inner) => !inner.eval(request),
            Self::And(a, b) => a.eval(request) && b.eval(request),
            Self::Or(a, b) => a.eval(request) || b.eval(request),
            Self::Exists(template) => match template {
                Template::Attr(path) => path.exists(request),
                other => other
                    .evaluate(request)
                    .map(|v| v.is_truthy())
                    .unwrap_or(false),
            },
            Self::Regex {
                lhs,
                pattern,
                negated,
            } => {
                let subject = lhs.expand(request);
                let matched = pattern.is_match(&subject);
                matched != *negated
            }
            Self::Compare {
                lhs,
                op,
                rhs,
                cast,
                via_callback,
            } => {
                if *via_callback {
                    let Some(path) = lhs.attr_path() else {
                        return false;
                    };
                    let Some(rhs_value) = rhs.evaluate(request) else {
                        return false;
                    };
                    return request.compare_virtual(&path.name, &rhs_value);
                }

                let Some(lhs_value) = lhs.evaluate(request) else {
                    return false;
                };
                let Some(rhs_value) = rhs.evaluate(request) else {
                    return false;
                };

                let target = cast.unwrap_or_else(|| lhs_value.kind());
                let (lhs_value, rhs_value) =
                    match (lhs_value.cast(target), rhs_value.cast(target)) {
                        (Ok(l), Ok(r)) => (l, r),
                        _ => {
                            trace!("condition cast failed, evaluating to false");
                            return false;
                        }
                    };

                let Some(ordering) = lhs_value.compare(&rhs_value) else {
                    return false;
                };

                match op {
                    CompOp::Eq => ordering.is_eq(),
                    CompOp::Ne => !ordering.is_eq(),
                    CompOp::Lt => ordering.is_lt(),
                    CompOp::Le => ordering.is_le(),
                    CompOp::Gt => ordering.is_gt(),
                    CompOp::Ge => ordering.is_ge(),
                    CompOp::RegexMatch | CompOp::RegexNotMatch => false,
                }
            }
        }
    }

    /// Pass-2 fixups: verify attribute references, collapse
    /// `"%{Attr}" != ''` idioms into existence tests and cast literal
    /// right-hand sides to the left-hand attribute's type.
    pub fn fixup(&mut self, dict: &Dictionary) -> Result<(), ConditionError> {
        match self {
            Self::True | Self::False => Ok(()),
            Self::Not(inner) => inner.fixup(dict),
            Self::And(a, b) | Self::Or(a, b) => {
                a.fixup(dict)?;
                b.fixup(dict)
            }
            Self::Exists(template) => {
                template.fixup(dict)?;
                Ok(())
            }
            Self::Regex { lhs, .. } => {
                lhs.fixup(dict)?;
                if let Some(path) = lhs.attr_path() {
                    if dict.lookup(&path.name).is_some_and(|def| def.is_virtual) {
                        return Err(ConditionError::VirtualRegex(path.name.clone()));
                    }
                }
                Ok(())
            }
            Self::Compare {
                lhs,
                op,
                rhs,
                cast,
                via_callback,
            } => {
                lhs.fixup(dict)?;
                rhs.fixup(dict)?;

                // "%{Attr}" != '' is an existence test in disguise.
                if cast.is_none() {
                    if let (Some(path), Template::Literal(value)) = (lhs.attr_path(), &*rhs) {
                        if value.as_str() == Some("") {
                            let exists = Self::Exists(Template::Attr(path.clone()));
                            *self = match op {
                                CompOp::Ne => exists,
                                CompOp::Eq => Self::Not(Box::new(exists)),
                                _ => return Ok(()),
                            };
                            return Ok(());
                        }
                    }
                }

                if let Some(path) = lhs.attr_path() {
                    let kind = cast.or_else(|| dict.kind_of(&path.name));
                    if let Some(kind) = kind {
                        rhs.cast_in_place(kind)?;
                    }

                    // Virtual attributes are compared via their callback,
                    // and only support the equality form of that call.
                    if dict.lookup(&path.name).is_some_and(|def| def.is_virtual) {
                        let name = path.name.clone();
                        if rhs.attr_path().is_some() {
                            return Err(ConditionError::VirtualAttrRhs(name));
                        }
                        if cast.is_some() {
                            return Err(ConditionError::VirtualCast(name));
                        }
                        if *op != CompOp::Eq {
                            return Err(ConditionError::VirtualOp(name));
                        }
                        *via_callback = true;
                    }
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Token {
    LParen,
    RParen,
    Not,
    And,
    Or,
    Op(CompOp),
    Cast(ValueKind),
    Word(String),
    Quoted(String),
    Regex(String),
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let bytes: Vec<char> = input.chars().collect();
    let mut i = 0;
    let mut last_was_match_op = false;

    while i < bytes.len() {
        let c = bytes[i];
        let expects_regex = last_was_match_op;
        last_was_match_op = false;

        match c {
            ' ' | '\t' => {
                i += 1;
                last_was_match_op = expects_regex;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    value.push(bytes[i]);
                    i += 1;
                }
                if i >= bytes.len() {
                    return Err(ConditionError::Unterminated("string"));
                }
                i += 1;
                tokens.push(Token::Quoted(value));
            }
            '/' if expects_regex => {
                let mut pattern = String::new();
                i += 1;
                while i < bytes.len() && bytes[i] != '/' {
                    if bytes[i] == '\\' && i + 1 < bytes.len() && bytes[i + 1] == '/' {
                        pattern.push('/');
                        i += 2;
                        continue;
                    }
                    pattern.push(bytes[i]);
                    i += 1;
                }
                if i >= bytes.len() {
                    return Err(ConditionError::Unterminated("regular expression"));
                }
                i += 1;
                tokens.push(Token::Regex(pattern));
            }
            '&' if i + 1 < bytes.len() && bytes[i + 1] == '&' => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if i + 1 < bytes.len() && bytes[i + 1] == '|' => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' => {
                if i + 1 < bytes.len() && bytes[i + 1] == '=' {
                    tokens.push(Token::Op(CompOp::Eq));
                    i += 2;
                } else if i + 1 < bytes.len() && bytes[i + 1] == '~' {
                    tokens.push(Token::Op(CompOp::RegexMatch));
                    last_was_match_op = true;
                    i += 2;
                } else {
                    return Err(ConditionError::Expected {
                        expected: "'==', '=~'",
                        found: "=".to_string(),
                    });
                }
            }
            '!' => {
                if i + 1 < bytes.len() && bytes[i + 1] == '=' {
                    tokens.push(Token::Op(CompOp::Ne));
                    i += 2;
                } else if i + 1 < bytes.len() && bytes[i + 1] == '~' {
                    tokens.push(Token::Op(CompOp::RegexNotMatch));
                    last_was_match_op = true;
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' => {
                // Either a cast <type> or a comparison.
                if let Some(close) = bytes[i + 1..].iter().position(|&c| c == '>') {
                    let name: String = bytes[i + 1..i + 1 + close].iter().collect();
                    if let Some(kind) = ValueKind::from_name(&name) {
                        tokens.push(Token::Cast(kind));
                        i += close + 2;
                        continue;
                    }
                }
                if i + 1 < bytes.len() && bytes[i + 1] == '=' {
                    tokens.push(Token::Op(CompOp::Le));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CompOp::Lt));
                    i += 1;
                }
            }
            '>' => {
                if i + 1 < bytes.len() && bytes[i + 1] == '=' {
                    tokens.push(Token::Op(CompOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CompOp::Gt));
                    i += 1;
                }
            }
            _ => {
                let mut word = String::new();
                while i < bytes.len() {
                    let c = bytes[i];
                    if c.is_whitespace() || matches!(c, '(' | ')' | '=' | '!' | '<' | '>') {
                        break;
                    }
                    // `&&` ends a word; a leading `&` belongs to it.
                    if c == '&' && !word.is_empty() {
                        break;
                    }
                    if c == '|' {
                        break;
                    }
                    word.push(c);
                    i += 1;
                }
                if word.is_empty() {
                    return Err(ConditionError::Expected {
                        expected: "operand",
                        found: c.to_string(),
                    });
                }
                tokens.push(Token::Word(word));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn describe_current(&self) -> String {
        match self.peek() {
            Some(token) => format!("{token:?}"),
            None => "end of input".to_string(),
        }
    }

    fn parse_or(&mut self) -> Result<Condition, ConditionError> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = match (lhs.constant(), rhs.constant()) {
                (Some(true), _) | (_, Some(true)) => Condition::True,
                (Some(false), None) => rhs,
                (None, Some(false)) => lhs,
                (Some(false), Some(false)) => Condition::False,
                _ => Condition::Or(Box::new(lhs), Box::new(rhs)),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Condition, ConditionError> {
        let mut lhs = self.parse_not()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.bump();
            let rhs = self.parse_not()?;
            lhs = match (lhs.constant(), rhs.constant()) {
                (Some(false), _) | (_, Some(false)) => Condition::False,
                (Some(true), None) => rhs,
                (None, Some(true)) => lhs,
                (Some(true), Some(true)) => Condition::True,
                _ => Condition::And(Box::new(lhs), Box::new(rhs)),
            };
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Condition, ConditionError> {
        match self.peek() {
            Some(Token::Not) => {
                self.bump();
                let inner = self.parse_not()?;
                Ok(match inner.constant() {
                    Some(b) => {
                        if b {
                            Condition::False
                        } else {
                            Condition::True
                        }
                    }
                    None => Condition::Not(Box::new(inner)),
                })
            }
            Some(Token::LParen) => {
                self.bump();
                let inner = self.parse_or()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ConditionError::Expected {
                        expected: "')'",
                        found: self.describe_current(),
                    }),
                }
            }
            Some(_) => self.parse_primary(),
            None => Err(ConditionError::Empty),
        }
    }

    fn parse_operand(&mut self) -> Result<(Template, Option<ValueKind>), ConditionError> {
        let mut cast = None;
        if let Some(Token::Cast(kind)) = self.peek() {
            cast = Some(*kind);
            self.bump();
        }

        match self.bump() {
            Some(Token::Quoted(s)) => {
                let template = if s.contains("%{") {
                    Template::parse(&format!("\"{s}\""))?
                } else {
                    Template::Literal(crate::types::Value::String(s))
                };
                Ok((template, cast))
            }
            Some(Token::Word(w)) => Ok((Template::parse(&w)?, cast)),
            Some(Token::Regex(_)) => Err(ConditionError::MisplacedRegex),
            other => Err(ConditionError::Expected {
                expected: "operand",
                found: format!("{other:?}"),
            }),
        }
    }

    fn parse_primary(&mut self) -> Result<Condition, ConditionError> {
        let (lhs, cast) = self.parse_operand()?;

        let op = match self.peek() {
            Some(Token::Op(op)) => {
                let op = *op;
                self.bump();
                op
            }
            _ => {
                // Bare operand: existence / truthiness.
                return Ok(match &lhs {
                    Template::Literal(value) => {
                        let truthy = match value.as_str() {
                            Some(s) => match s.parse::<i64>() {
                                Ok(n) => n != 0,
                                Err(_) => !s.is_empty(),
                            },
                            None => value.is_truthy(),
                        };
                        if truthy {
                            Condition::True
                        } else {
                            Condition::False
                        }
                    }
                    _ => Condition::Exists(lhs),
                });
            }
        };

        if matches!(op, CompOp::RegexMatch | CompOp::RegexNotMatch) {
            let pattern = match self.bump() {
                Some(Token::Regex(p)) => p,
                Some(Token::Quoted(p)) => p,
                other => {
                    return Err(ConditionError::Expected {
                        expected: "regular expression",
                        found: format!("{other:?}"),
                    })
                }
            };
            return Ok(Condition::Regex {
                lhs,
                pattern: Regex::new(&pattern)?,
                negated: op == CompOp::RegexNotMatch,
            });
        }

        let (rhs, rhs_cast) = self.parse_operand()?;
        Ok(Condition::Compare {
            lhs,
            op,
            rhs,
            cast: cast.or(rhs_cast),
            via_callback: false,
        })
    }
}
