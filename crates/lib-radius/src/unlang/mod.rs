//! The policy interpreter.
//!
//! Server sections are compiled once at load time into read-only trees of
//! callables ([`compile`]), then walked per request by a resumable frame
//! stack ([`interp`]). Module return codes are mapped to actions (return,
//! reject, numeric priority) by per-node action tables ([`action`]).

mod action;
mod ast;
mod compile;
mod condition;
mod dict;
mod interp;
mod map;
mod parse;
mod template;

pub use action::*;
pub use ast::*;
pub use compile::*;
pub use condition::*;
pub use dict::*;
pub use interp::*;
pub use map::*;
pub use parse::*;
pub use template::*;

use std::collections::HashMap;
use std::fmt::Display;

use crate::request::Request;

/// The nine-valued code a module (or a whole section) reports.
///
/// This is not an error type; failures of policy are ordinary values here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum ReturnCode {
    Reject = 0,
    Fail = 1,
    Ok = 2,
    Handled = 3,
    Invalid = 4,
    UserLock = 5,
    NotFound = 6,
    Noop = 7,
    Updated = 8,
}

pub const RETURN_CODE_COUNT: usize = 9;

impl ReturnCode {
    pub const ALL: [ReturnCode; RETURN_CODE_COUNT] = [
        Self::Reject,
        Self::Fail,
        Self::Ok,
        Self::Handled,
        Self::Invalid,
        Self::UserLock,
        Self::NotFound,
        Self::Noop,
        Self::Updated,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "reject" => Some(Self::Reject),
            "fail" => Some(Self::Fail),
            "ok" => Some(Self::Ok),
            "handled" => Some(Self::Handled),
            "invalid" => Some(Self::Invalid),
            "userlock" => Some(Self::UserLock),
            "notfound" => Some(Self::NotFound),
            "noop" => Some(Self::Noop),
            "updated" => Some(Self::Updated),
            _ => None,
        }
    }
}

impl Display for ReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Reject => "reject",
            Self::Fail => "fail",
            Self::Ok => "ok",
            Self::Handled => "handled",
            Self::Invalid => "invalid",
            Self::UserLock => "userlock",
            Self::NotFound => "notfound",
            Self::Noop => "noop",
            Self::Updated => "updated",
        };
        write!(f, "{name}")
    }
}

/// The processing stages a virtual server can define.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    Authenticate,
    Authorize,
    Preacct,
    Accounting,
    Session,
    PreProxy,
    PostProxy,
    PostAuth,
    RecvCoa,
    SendCoa,
}

impl SectionKind {
    pub const ALL: [SectionKind; 10] = [
        Self::Authenticate,
        Self::Authorize,
        Self::Preacct,
        Self::Accounting,
        Self::Session,
        Self::PreProxy,
        Self::PostProxy,
        Self::PostAuth,
        Self::RecvCoa,
        Self::SendCoa,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Authenticate => "authenticate",
            Self::Authorize => "authorize",
            Self::Preacct => "preacct",
            Self::Accounting => "accounting",
            Self::Session => "session",
            Self::PreProxy => "pre-proxy",
            Self::PostProxy => "post-proxy",
            Self::PostAuth => "post-auth",
            Self::RecvCoa => "recv-coa",
            Self::SendCoa => "send-coa",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.name() == name)
    }
}

impl Display for SectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Simple groups resolve codes normally; redundant groups fall through on
/// failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupType {
    Simple,
    Redundant,
}

/// A named collection of compiled sections, invoked by name from the I/O
/// path and from the TLS cache glue.
#[derive(Debug, Default)]
pub struct VirtualServer {
    pub name: String,
    sections: HashMap<(SectionKind, Option<String>), Tree>,
}

impl VirtualServer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sections: HashMap::new(),
        }
    }

    pub fn add_section(&mut self, kind: SectionKind, name2: Option<String>, tree: Tree) {
        self.sections.insert((kind, name2), tree);
    }

    pub fn section(&self, kind: SectionKind, name2: Option<&str>) -> Option<&Tree> {
        self.sections
            .get(&(kind, name2.map(|s| s.to_string())))
    }

    /// Run one section. A missing section is a noop, as with an empty
    /// configuration block.
    pub async fn run(
        &self,
        kind: SectionKind,
        name2: Option<&str>,
        request: &mut Request,
    ) -> ReturnCode {
        match self.section(kind, name2) {
            Some(tree) => execute(tree, request).await,
            None => ReturnCode::Noop,
        }
    }
}
