use std::collections::HashMap;

/// Parsed configuration shape: a section has two names and an ordered list
/// of items, each either a nested section or a pair.
///
/// `policy { ... }` catalogs and server sections share this shape; the
/// compiler assigns meaning to the keywords.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionAst {
    pub name1: String,
    pub name2: Option<String>,
    pub items: Vec<ItemAst>,
}

impl SectionAst {
    pub fn new(name1: impl Into<String>, name2: Option<String>) -> Self {
        Self {
            name1: name1.into(),
            name2,
            items: Vec::new(),
        }
    }
}

/// One entry of a section body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemAst {
    Section(SectionAst),
    /// `attr`, `attr = value`, or `&attr := value`. A pair with no value is
    /// a module / policy / keyword reference.
    Pair {
        attr: String,
        op: Option<String>,
        value: Option<String>,
    },
}

impl ItemAst {
    pub fn module_ref(name: impl Into<String>) -> Self {
        Self::Pair {
            attr: name.into(),
            op: None,
            value: None,
        }
    }
}

/// The named policies available to section compilation.
#[derive(Debug, Clone, Default)]
pub struct PolicyCatalog {
    policies: HashMap<String, SectionAst>,
}

impl PolicyCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a parsed `policy { ... }` section.
    pub fn from_section(section: &SectionAst) -> Self {
        let mut catalog = Self::new();
        for item in &section.items {
            if let ItemAst::Section(sub) = item {
                catalog.add(sub.clone());
            }
        }
        catalog
    }

    /// Policies are stored under their full name, which may carry a method
    /// suffix (`name.authorize`).
    pub fn add(&mut self, section: SectionAst) {
        self.policies.insert(section.name1.clone(), section);
    }

    pub fn get(&self, name: &str) -> Option<&SectionAst> {
        self.policies.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
