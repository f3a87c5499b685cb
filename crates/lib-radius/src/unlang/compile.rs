use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::constants::MAX_FOREACH_DEPTH;
use crate::module::{MapProcessor, MapRegistry, Module, ModuleRegistry};
use crate::types::Value;
use crate::unlang::{
    authtype_actions, default_actions, Action, ActionTable, AttrIndex, AttrMap, Condition,
    ConditionError, Dictionary, GroupType, ItemAst, MapError, PolicyCatalog, ReturnCode,
    SectionAst, SectionKind, Template, TemplateError,
};

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Failed to find \"{0}\" as a module or policy")]
    UnknownModule(String),

    #[error("\"{module}\" modules aren't allowed in '{section}' sections -- they have no such method")]
    NoSuchMethod { module: String, section: SectionKind },

    #[error("'{0}' sections cannot be empty")]
    EmptySection(String),

    #[error("'{0}' without condition")]
    MissingCondition(String),

    #[error("'else' cannot have a condition")]
    ElseWithCondition,

    #[error("Invalid location for '{0}'. There is no preceding 'if' or 'elsif' statement")]
    MisplacedElse(String),

    #[error("You must specify a variable to switch over for 'switch'")]
    SwitchWithoutTemplate,

    #[error("\"switch\" sections can only have \"case\" subsections")]
    SwitchBadChild,

    #[error("Cannot have two 'default' case statements")]
    TwoDefaultCases,

    #[error("\"case\" statements may only appear within a \"switch\" section")]
    CaseOutsideSwitch,

    #[error("'break' can only be used in a 'foreach' section")]
    BreakOutsideForeach,

    #[error("foreach sections may not be nested more than {0} deep")]
    ForeachTooDeep(usize),

    #[error("You must specify an attribute to loop over for 'foreach'")]
    ForeachWithoutAttr,

    #[error("{section} sections cannot contain a \"{child}\" statement")]
    RedundantBadChild { section: String, child: String },

    #[error("'actions' MUST be the last block in a section")]
    ActionsNotLast,

    #[error("'actions' MUST NOT be in a '{0}' block")]
    ActionsNotAllowed(String),

    #[error("Invalid subsection. Expected 'action = value'")]
    ActionsSubsection,

    #[error("Unknown module rcode '{0}'")]
    UnknownRcode(String),

    #[error("Unknown action '{0}'")]
    UnknownAction(String),

    #[error("Unknown map processor \"{0}\"")]
    UnknownMapProcessor(String),

    #[error("Entry is not a reference to a module")]
    BadEntry,

    #[error("Invalid condition: {0}")]
    Condition(#[from] ConditionError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Map(#[from] MapError),

    #[error(transparent)]
    Cast(#[from] crate::types::CastError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// Variant payload of a compiled callable.
pub enum NodeKind {
    Single { module: Arc<dyn Module> },
    Group { group_type: GroupType },
    LoadBalance { redundant: bool },
    If { condition: Condition, elsif: bool },
    Else,
    Switch { template: Template },
    Case { value: Option<Value> },
    Foreach { template: Template },
    Break,
    Return,
    Update { maps: Vec<AttrMap> },
    Map { processor: Arc<dyn MapProcessor>, template: Template, maps: Vec<AttrMap> },
    Xlat { template: Template },
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Single { module } => return write!(f, "Single({})", module.name()),
            Self::Group { group_type } => return write!(f, "Group({group_type:?})"),
            Self::LoadBalance { redundant: false } => "LoadBalance",
            Self::LoadBalance { redundant: true } => "RedundantLoadBalance",
            Self::If { elsif: false, .. } => "If",
            Self::If { elsif: true, .. } => "Elsif",
            Self::Else => "Else",
            Self::Switch { .. } => "Switch",
            Self::Case { .. } => "Case",
            Self::Foreach { .. } => "Foreach",
            Self::Break => "Break",
            Self::Return => "Return",
            Self::Update { .. } => "Update",
            Self::Map { .. } => "Map",
            Self::Xlat { .. } => "Xlat",
        };
        write!(f, "{name}")
    }
}

/// One compiled callable. The tree is built once at load time and is
/// read-only at request time.
#[derive(Debug)]
pub struct Node {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub name: String,
    pub actions: ActionTable,
    pub method: SectionKind,
}

/// A compiled server section.
#[derive(Debug)]
pub struct Tree {
    pub section: SectionKind,
    pub name: String,
    nodes: Vec<Node>,
    pub root: NodeId,
}

impl Tree {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    fn add(&mut self, kind: NodeKind, parent: Option<NodeId>, name: String, method: SectionKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            kind,
            parent,
            children: Vec::new(),
            name,
            actions: ActionTable::default(),
            method,
        });
        if let Some(parent) = parent {
            self.nodes[parent.0].children.push(id);
        }
        id
    }

    fn parent_group_type(&self, id: NodeId) -> GroupType {
        match self.node(id).parent {
            None => GroupType::Simple,
            Some(parent) => match &self.node(parent).kind {
                NodeKind::Group { group_type } => *group_type,
                NodeKind::LoadBalance { redundant: true } => GroupType::Redundant,
                _ => GroupType::Simple,
            },
        }
    }

    fn has_foreach_ancestor(&self, mut id: NodeId) -> bool {
        while let Some(parent) = self.node(id).parent {
            if matches!(self.node(parent).kind, NodeKind::Foreach { .. }) {
                return true;
            }
            id = parent;
        }
        false
    }

    fn foreach_depth(&self, mut id: NodeId) -> usize {
        let mut depth = 0;
        while let Some(parent) = self.node(id).parent {
            if matches!(self.node(parent).kind, NodeKind::Foreach { .. }) {
                depth += 1;
            }
            id = parent;
        }
        depth
    }
}

/// Everything section compilation reads: modules, map processors, the
/// policy catalog and the dictionary. All immutable after startup.
pub struct CompileCtx<'a> {
    pub modules: &'a ModuleRegistry,
    pub maps: &'a MapRegistry,
    pub policies: &'a PolicyCatalog,
    pub dict: &'a Dictionary,
}

impl<'a> CompileCtx<'a> {
    /// Compile one server section into a callable tree.
    pub fn compile(&self, ast: &SectionAst, section: SectionKind) -> Result<Tree, CompileError> {
        let mut tree = Tree {
            section,
            name: match &ast.name2 {
                Some(name2) => format!("{} {}", ast.name1, name2),
                None => ast.name1.clone(),
            },
            nodes: Vec::new(),
            root: NodeId(0),
        };

        let root = tree.add(
            NodeKind::Group {
                group_type: GroupType::Simple,
            },
            None,
            tree.name.clone(),
            section,
        );
        tree.root = root;

        let mut state = Compiler {
            ctx: self,
            tree: &mut tree,
            policy_stack: Vec::new(),
        };
        state.compile_children(ast, root, section)?;

        self.fill_default_actions(&mut tree);
        Ok(tree)
    }

    /// Fill every unset action slot with the applicable default table.
    fn fill_default_actions(&self, tree: &mut Tree) {
        let section = tree.section;
        for index in 0..tree.nodes.len() {
            let id = NodeId(index);
            let parent_group = tree.parent_group_type(id);
            let is_root = tree.node(id).parent.is_none();

            let defaults = if !is_root && section == SectionKind::Authenticate {
                // Inside authenticate, nested code follows the Auth-Type
                // rules at any depth.
                authtype_actions(parent_group)
            } else {
                default_actions(section, parent_group)
            };

            tree.node_mut(id).actions.fill_defaults(&defaults);
        }
    }
}

struct Compiler<'a, 'b> {
    ctx: &'b CompileCtx<'a>,
    tree: &'b mut Tree,
    policy_stack: Vec<String>,
}

impl<'a, 'b> Compiler<'a, 'b> {
    fn compile_children(
        &mut self,
        ast: &SectionAst,
        parent: NodeId,
        method: SectionKind,
    ) -> Result<(), CompileError> {
        for (position, item) in ast.items.iter().enumerate() {
            match item {
                ItemAst::Pair {
                    attr,
                    op: None,
                    value: None,
                } => {
                    self.compile_ref(attr, None, parent, method)?;
                }

                ItemAst::Pair {
                    attr,
                    op: Some(op),
                    value,
                } if op == "=" && value.is_some() => {
                    // `rcode = action` lines override this block's table.
                    self.apply_action_pair(parent, attr, value.as_deref().unwrap())?;
                }

                ItemAst::Pair { .. } => return Err(CompileError::BadEntry),

                ItemAst::Section(sub) if sub.name1 == "actions" => {
                    if position + 1 != ast.items.len() {
                        return Err(CompileError::ActionsNotLast);
                    }
                    let allowed = matches!(
                        self.tree.node(parent).kind,
                        NodeKind::If { .. } | NodeKind::Else | NodeKind::Case { .. }
                    );
                    if !allowed {
                        return Err(CompileError::ActionsNotAllowed(
                            self.tree.node(parent).name.clone(),
                        ));
                    }
                    self.apply_action_section(parent, sub)?;
                }

                ItemAst::Section(sub) => {
                    self.compile_section_item(sub, parent, method)?;
                }
            }
        }
        Ok(())
    }

    fn compile_section_item(
        &mut self,
        sub: &SectionAst,
        parent: NodeId,
        method: SectionKind,
    ) -> Result<(), CompileError> {
        let empty_allowed = matches!(sub.name1.as_str(), "case" | "if" | "elsif");
        if sub.items.is_empty() && !empty_allowed && is_keyword(&sub.name1) {
            return Err(CompileError::EmptySection(sub.name1.clone()));
        }

        match sub.name1.as_str() {
            "group" => {
                let id = self.add_group(parent, GroupType::Simple, "group", method);
                self.compile_children(sub, id, method)
            }
            "redundant" => {
                self.check_redundant_children(sub)?;
                let id = self.add_group(parent, GroupType::Redundant, "redundant", method);
                self.compile_children(sub, id, method)
            }
            "load-balance" => {
                self.check_redundant_children(sub)?;
                let id = self.tree.add(
                    NodeKind::LoadBalance { redundant: false },
                    Some(parent),
                    "load-balance".to_string(),
                    method,
                );
                self.compile_children(sub, id, method)
            }
            "redundant-load-balance" => {
                self.check_redundant_children(sub)?;
                let id = self.tree.add(
                    NodeKind::LoadBalance { redundant: true },
                    Some(parent),
                    "redundant-load-balance".to_string(),
                    method,
                );
                self.compile_children(sub, id, method)
            }
            "if" => self.compile_if(sub, parent, method, false),
            "elsif" => self.compile_elsif(sub, parent, method),
            "else" => self.compile_else(sub, parent, method),
            "switch" => self.compile_switch(sub, parent, method),
            "case" => Err(CompileError::CaseOutsideSwitch),
            "foreach" => self.compile_foreach(sub, parent, method),
            "update" => self.compile_update(sub, parent, method),
            "map" => self.compile_map(sub, parent, method),
            _ => {
                // A module or policy reference with action overrides.
                self.compile_ref(&sub.name1, Some(sub), parent, method)?;
                Ok(())
            }
        }
    }

    fn add_group(
        &mut self,
        parent: NodeId,
        group_type: GroupType,
        name: &str,
        method: SectionKind,
    ) -> NodeId {
        self.tree.add(
            NodeKind::Group { group_type },
            Some(parent),
            name.to_string(),
            method,
        )
    }

    fn check_redundant_children(&self, ast: &SectionAst) -> Result<(), CompileError> {
        for item in &ast.items {
            if let ItemAst::Section(sub) = item {
                if matches!(
                    sub.name1.as_str(),
                    "if" | "else" | "elsif" | "update" | "switch" | "case"
                ) {
                    return Err(CompileError::RedundantBadChild {
                        section: ast.name1.clone(),
                        child: sub.name1.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn compile_if(
        &mut self,
        sub: &SectionAst,
        parent: NodeId,
        method: SectionKind,
        elsif: bool,
    ) -> Result<(), CompileError> {
        let keyword = if elsif { "elsif" } else { "if" };
        let raw = sub
            .name2
            .as_deref()
            .ok_or_else(|| CompileError::MissingCondition(keyword.to_string()))?;

        let mut condition = Condition::parse(raw)?;
        condition.fixup(self.ctx.dict)?;

        let id = self.tree.add(
            NodeKind::If { condition, elsif },
            Some(parent),
            format!("{keyword} {raw}"),
            method,
        );

        // An always-false branch is pruned: the children are never
        // compiled, let alone executed.
        let constant = match &self.tree.node(id).kind {
            NodeKind::If { condition, .. } => condition.constant(),
            _ => unreachable!(),
        };
        if constant == Some(false) {
            info!("# Skipping contents of '{keyword}' as it is always 'false'");
            return Ok(());
        }

        self.compile_children(sub, id, method)
    }

    fn previous_if(&self, parent: NodeId, keyword: &str) -> Result<Option<bool>, CompileError> {
        let previous = self
            .tree
            .node(parent)
            .children
            .last()
            .copied()
            .ok_or_else(|| CompileError::MisplacedElse(keyword.to_string()))?;

        match &self.tree.node(previous).kind {
            NodeKind::If { condition, .. } => Ok(condition.constant()),
            _ => Err(CompileError::MisplacedElse(keyword.to_string())),
        }
    }

    fn compile_elsif(
        &mut self,
        sub: &SectionAst,
        parent: NodeId,
        method: SectionKind,
    ) -> Result<(), CompileError> {
        if sub.name2.is_none() {
            return Err(CompileError::MissingCondition("elsif".to_string()));
        }

        if self.previous_if(parent, "elsif")? == Some(true) {
            // The previous branch always matches; this one can never run.
            info!("# Skipping contents of 'elsif' as previous branch is always 'true'");
            self.tree.add(
                NodeKind::If {
                    condition: Condition::False,
                    elsif: true,
                },
                Some(parent),
                "elsif".to_string(),
                method,
            );
            return Ok(());
        }

        self.compile_if(sub, parent, method, true)
    }

    fn compile_else(
        &mut self,
        sub: &SectionAst,
        parent: NodeId,
        method: SectionKind,
    ) -> Result<(), CompileError> {
        if sub.name2.is_some() {
            return Err(CompileError::ElseWithCondition);
        }

        let skip = self.previous_if(parent, "else")? == Some(true);
        let id = self
            .tree
            .add(NodeKind::Else, Some(parent), "else".to_string(), method);

        if skip {
            info!("# Skipping contents of 'else' as previous branch is always 'true'");
            return Ok(());
        }

        self.compile_children(sub, id, method)
    }

    fn compile_switch(
        &mut self,
        sub: &SectionAst,
        parent: NodeId,
        method: SectionKind,
    ) -> Result<(), CompileError> {
        let raw = sub
            .name2
            .as_deref()
            .ok_or(CompileError::SwitchWithoutTemplate)?;

        let mut template = Template::parse(raw)?;
        template.fixup(self.ctx.dict)?;

        // The type the case literals are cast to.
        let case_kind = template
            .attr_path()
            .and_then(|path| self.ctx.dict.kind_of(&path.name));

        let mut seen_default = false;
        for item in &sub.items {
            match item {
                ItemAst::Section(case) if case.name1 == "case" => {
                    if case.name2.is_none() {
                        if seen_default {
                            return Err(CompileError::TwoDefaultCases);
                        }
                        seen_default = true;
                    }
                }
                _ => return Err(CompileError::SwitchBadChild),
            }
        }

        let id = self.tree.add(
            NodeKind::Switch { template },
            Some(parent),
            format!("switch {raw}"),
            method,
        );

        for item in &sub.items {
            let ItemAst::Section(case) = item else {
                unreachable!("validated above");
            };
            self.compile_case(case, id, method, case_kind)?;
        }
        Ok(())
    }

    fn compile_case(
        &mut self,
        sub: &SectionAst,
        switch: NodeId,
        method: SectionKind,
        case_kind: Option<crate::types::ValueKind>,
    ) -> Result<(), CompileError> {
        let value = match sub.name2.as_deref() {
            None => None,
            Some(raw) => {
                let literal = strip_case_quotes(raw);
                let mut value = Value::String(literal.to_string());
                if let Some(kind) = case_kind {
                    value = value.cast(kind)?;
                }
                Some(value)
            }
        };

        let name = match &sub.name2 {
            Some(raw) => format!("case {raw}"),
            None => "case".to_string(),
        };

        let id = self
            .tree
            .add(NodeKind::Case { value }, Some(switch), name, method);
        self.compile_children(sub, id, method)?;

        // Cases never fall through.
        self.tree.node_mut(id).actions = ActionTable::all_return();
        Ok(())
    }

    fn compile_foreach(
        &mut self,
        sub: &SectionAst,
        parent: NodeId,
        method: SectionKind,
    ) -> Result<(), CompileError> {
        let raw = sub.name2.as_deref().ok_or(CompileError::ForeachWithoutAttr)?;

        let mut template = Template::parse(raw)?;
        template.fixup(self.ctx.dict)?;

        let Some(path) = template.attr_path() else {
            return Err(CompileError::ForeachWithoutAttr);
        };
        // Loop over every instance of the attribute.
        let mut path = path.clone();
        path.index = AttrIndex::All;
        let template = Template::Attr(path);

        if self.tree.foreach_depth(parent) + 1 > MAX_FOREACH_DEPTH {
            return Err(CompileError::ForeachTooDeep(MAX_FOREACH_DEPTH));
        }

        let id = self.tree.add(
            NodeKind::Foreach { template },
            Some(parent),
            format!("foreach {raw}"),
            method,
        );
        self.compile_children(sub, id, method)
    }

    fn compile_update(
        &mut self,
        sub: &SectionAst,
        parent: NodeId,
        method: SectionKind,
    ) -> Result<(), CompileError> {
        let mut maps = Vec::new();
        for item in &sub.items {
            let ItemAst::Pair {
                attr,
                op: Some(op),
                value,
            } = item
            else {
                return Err(CompileError::BadEntry);
            };

            let mut map = AttrMap::parse(attr, op, value.as_deref())?;
            map.fixup(self.ctx.dict)?;
            maps.push(map);
        }

        self.tree.add(
            NodeKind::Update { maps },
            Some(parent),
            "update".to_string(),
            method,
        );
        Ok(())
    }

    fn compile_map(
        &mut self,
        sub: &SectionAst,
        parent: NodeId,
        method: SectionKind,
    ) -> Result<(), CompileError> {
        let raw = sub.name2.as_deref().unwrap_or_default();
        let (processor_name, template_raw) = match raw.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (raw, ""),
        };

        let processor = self
            .ctx
            .maps
            .find(processor_name)
            .ok_or_else(|| CompileError::UnknownMapProcessor(processor_name.to_string()))?;

        let mut template = Template::parse(template_raw)?;
        template.fixup(self.ctx.dict)?;

        let mut maps = Vec::new();
        for item in &sub.items {
            let ItemAst::Pair {
                attr,
                op: Some(op),
                value,
            } = item
            else {
                return Err(CompileError::BadEntry);
            };
            let mut map = AttrMap::parse(attr, op, value.as_deref())?;
            map.fixup(self.ctx.dict)?;
            maps.push(map);
        }

        self.tree.add(
            NodeKind::Map {
                processor,
                template,
                maps,
            },
            Some(parent),
            format!("map {raw}"),
            method,
        );
        Ok(())
    }

    /// A bare reference: keyword terminators, in-place expansions, then
    /// policies, then real modules.
    fn compile_ref(
        &mut self,
        name: &str,
        overrides: Option<&SectionAst>,
        parent: NodeId,
        method: SectionKind,
    ) -> Result<Option<NodeId>, CompileError> {
        if name == "break" {
            if !self.tree.has_foreach_ancestor(parent)
                && !matches!(self.tree.node(parent).kind, NodeKind::Foreach { .. })
            {
                return Err(CompileError::BreakOutsideForeach);
            }
            return Ok(Some(self.tree.add(
                NodeKind::Break,
                Some(parent),
                "break".to_string(),
                method,
            )));
        }

        if name == "return" {
            return Ok(Some(self.tree.add(
                NodeKind::Return,
                Some(parent),
                "return".to_string(),
                method,
            )));
        }

        if name.starts_with("%{") || name.starts_with('`') {
            let template = Template::parse(name)?;
            return Ok(Some(self.tree.add(
                NodeKind::Xlat { template },
                Some(parent),
                "expand".to_string(),
                method,
            )));
        }

        // "name.method" invokes a different method on the target.
        let (base, target_method) = match name.rsplit_once('.') {
            Some((base, suffix)) => match SectionKind::from_name(suffix) {
                Some(section) => (base, section),
                None => (name, method),
            },
            None => (name, method),
        };

        if let Some(node) = self.compile_policy_ref(name, base, overrides, parent, target_method)? {
            return Ok(Some(node));
        }

        // Not a policy. It must be a real module; a leading '-' makes the
        // reference optional.
        let (real_name, soft) = match base.strip_prefix('-') {
            Some(stripped) => (stripped, true),
            None => (base, false),
        };

        let Some(module) = self.ctx.modules.find(real_name) else {
            if soft {
                warn!("Ignoring \"{real_name}\" (optional module not found)");
                return Ok(None);
            }
            return Err(CompileError::UnknownModule(base.to_string()));
        };

        if !module.has_method(target_method) {
            return Err(CompileError::NoSuchMethod {
                module: real_name.to_string(),
                section: target_method,
            });
        }

        let id = self.tree.add(
            NodeKind::Single { module },
            Some(parent),
            real_name.to_string(),
            target_method,
        );

        if let Some(overrides) = overrides {
            self.apply_action_section(id, overrides)?;
        }
        Ok(Some(id))
    }

    /// Resolve a name against the policy catalog, compiling the policy
    /// body inline as a group. A reference that would re-enter its own
    /// containing policy falls through to the module of the same name.
    fn compile_policy_ref(
        &mut self,
        full_name: &str,
        base: &str,
        overrides: Option<&SectionAst>,
        parent: NodeId,
        method: SectionKind,
    ) -> Result<Option<NodeId>, CompileError> {
        let catalog = self.ctx.policies;

        // "foo" prefers a method-specific policy "foo.<method>".
        let method_specific = format!("{base}.{}", method.name());
        let (policy_name, policy) = if full_name == base {
            match catalog.get(&method_specific) {
                Some(policy) => (method_specific, Some(policy)),
                None => (base.to_string(), catalog.get(base)),
            }
        } else {
            (base.to_string(), catalog.get(base))
        };

        let Some(policy) = policy else {
            return Ok(None);
        };

        if self.policy_stack.contains(&policy_name) {
            // Recursive policy reference; use the module instead.
            return Ok(None);
        }

        let id = self.tree.add(
            NodeKind::Group {
                group_type: GroupType::Simple,
            },
            Some(parent),
            policy_name.clone(),
            method,
        );

        self.policy_stack.push(policy_name);
        let policy = policy.clone();
        let result = self.compile_children(&policy, id, method);
        self.policy_stack.pop();
        result?;

        if let Some(overrides) = overrides {
            self.apply_action_section(id, overrides)?;
        }
        Ok(Some(id))
    }

    fn apply_action_section(
        &mut self,
        node: NodeId,
        section: &SectionAst,
    ) -> Result<(), CompileError> {
        for item in &section.items {
            match item {
                ItemAst::Pair {
                    attr,
                    op: Some(op),
                    value: Some(value),
                } if op == "=" => {
                    self.apply_action_pair(node, attr, value)?;
                }
                _ => return Err(CompileError::ActionsSubsection),
            }
        }
        Ok(())
    }

    fn apply_action_pair(
        &mut self,
        node: NodeId,
        attr: &str,
        value: &str,
    ) -> Result<(), CompileError> {
        let action = match value {
            "return" | "break" => Action::Return,
            "reject" => Action::Reject,
            number if number.chars().all(|c| c.is_ascii_digit()) => {
                let priority: u8 = number
                    .parse()
                    .map_err(|_| CompileError::UnknownAction(value.to_string()))?;
                // Priority zero is reserved for "unset".
                if priority == 0 {
                    return Err(CompileError::UnknownAction(value.to_string()));
                }
                Action::Priority(priority)
            }
            other => return Err(CompileError::UnknownAction(other.to_string())),
        };

        if attr == "default" {
            self.tree.node_mut(node).actions.fill_with(action);
            return Ok(());
        }

        let rcode = ReturnCode::from_name(attr)
            .ok_or_else(|| CompileError::UnknownRcode(attr.to_string()))?;
        self.tree.node_mut(node).actions.set(rcode, action);
        Ok(())
    }
}

fn is_keyword(name: &str) -> bool {
    matches!(
        name,
        "group"
            | "redundant"
            | "load-balance"
            | "redundant-load-balance"
            | "if"
            | "elsif"
            | "else"
            | "switch"
            | "case"
            | "foreach"
            | "update"
            | "map"
    )
}

fn strip_case_quotes(input: &str) -> &str {
    let trimmed = input.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    }
}
