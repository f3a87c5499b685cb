use std::fmt::Display;

use crate::unlang::{GroupType, ReturnCode, SectionKind, RETURN_CODE_COUNT};

/// What a node does with a child's return code.
///
/// `Unset` means "inherit the applicable default"; every slot is filled at
/// compile time, so the interpreter never sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Unset,
    /// Stop this node and propagate the code up.
    Return,
    /// Override the code to `reject` and return up.
    Reject,
    /// Note the code if this priority beats the best seen so far, then
    /// keep executing siblings. Priorities are 1-based and strictly
    /// ordered.
    Priority(u8),
}

impl Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unset => write!(f, "unset"),
            Self::Return => write!(f, "return"),
            Self::Reject => write!(f, "reject"),
            Self::Priority(p) => write!(f, "{p}"),
        }
    }
}

/// One action per return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionTable([Action; RETURN_CODE_COUNT]);

impl Default for ActionTable {
    fn default() -> Self {
        Self([Action::Unset; RETURN_CODE_COUNT])
    }
}

impl ActionTable {
    pub const fn new(actions: [Action; RETURN_CODE_COUNT]) -> Self {
        Self(actions)
    }

    /// All codes return; used for `case` blocks to prevent fallthrough.
    pub fn all_return() -> Self {
        Self([Action::Return; RETURN_CODE_COUNT])
    }

    pub fn get(&self, code: ReturnCode) -> Action {
        self.0[code.index()]
    }

    pub fn set(&mut self, code: ReturnCode, action: Action) {
        self.0[code.index()] = action;
    }

    /// Fill every unset slot with `action`; used for `default = ...`.
    pub fn fill_with(&mut self, action: Action) {
        for slot in &mut self.0 {
            if *slot == Action::Unset {
                *slot = action;
            }
        }
    }

    /// Inherit defaults into every unset slot.
    pub fn fill_defaults(&mut self, defaults: &ActionTable) {
        for (slot, default) in self.0.iter_mut().zip(defaults.0.iter()) {
            if *slot == Action::Unset {
                *slot = *default;
            }
        }
    }
}

const R: Action = Action::Return;

const fn p(n: u8) -> Action {
    Action::Priority(n)
}

/// Redundant blocks everywhere: `fail` falls through to the next child,
/// everything else returns.
const REDUNDANT: ActionTable = ActionTable::new([R, p(1), R, R, R, R, R, R, R]);

// Slot order: reject, fail, ok, handled, invalid, userlock, notfound,
// noop, updated.

const AUTHENTICATE_GROUP: ActionTable = ActionTable::new([R, p(1), R, R, p(1), R, R, p(1), p(1)]);

const AUTHORIZE_GROUP: ActionTable = ActionTable::new([R, R, p(3), R, R, R, p(1), p(2), p(4)]);

const PREACCT_GROUP: ActionTable = ActionTable::new([R, R, p(2), R, R, R, R, p(1), p(3)]);

const ACCOUNTING_GROUP: ActionTable = ActionTable::new([R, R, p(2), R, R, R, R, p(1), p(3)]);

/// Redundant blocks inside accounting only stop on ok or handled; every
/// soft failure falls through so the next detail writer gets a try.
const ACCOUNTING_REDUNDANT: ActionTable =
    ActionTable::new([p(1), p(1), R, R, p(1), p(1), p(1), p(2), p(4)]);

const SESSION_GROUP: ActionTable = ActionTable::new([R, p(1), R, R, R, R, R, R, R]);

/// Shared by pre-proxy, post-proxy, post-auth, recv-coa and send-coa.
const GENERIC_GROUP: ActionTable = ActionTable::new([R, R, p(3), R, R, R, p(1), p(2), p(4)]);

/// The default table for a node, chosen by the section it is compiled in
/// and its parent's group type.
pub fn default_actions(section: SectionKind, group: GroupType) -> ActionTable {
    match group {
        GroupType::Redundant => match section {
            SectionKind::Accounting => ACCOUNTING_REDUNDANT,
            _ => REDUNDANT,
        },
        GroupType::Simple => match section {
            SectionKind::Authenticate => AUTHENTICATE_GROUP,
            SectionKind::Authorize => AUTHORIZE_GROUP,
            SectionKind::Preacct => PREACCT_GROUP,
            SectionKind::Accounting => ACCOUNTING_GROUP,
            SectionKind::Session => SESSION_GROUP,
            _ => GENERIC_GROUP,
        },
    }
}

/// Inside `Auth-Type` sub-sections of `authenticate`, a distinct override
/// table applies.
pub fn authtype_actions(group: GroupType) -> ActionTable {
    match group {
        GroupType::Simple => ActionTable::new([R, R, p(2), R, R, R, p(1), p(3), p(4)]),
        GroupType::Redundant => REDUNDANT,
    }
}
