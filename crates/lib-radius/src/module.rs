use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::request::Request;
use crate::unlang::{AttrMap, ReturnCode, SectionKind};
use crate::types::Value;

/// A policy module instance, e.g. `pap` or `sql`.
///
/// Modules expose one method per section kind; a `Single` node carries the
/// instance plus the selected method. Invocations may suspend, which is why
/// the interpreter keeps its own explicit stack.
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    /// Does this instance implement the given method? Referencing a module
    /// in a section it has no method for is a compile error.
    fn has_method(&self, _method: SectionKind) -> bool {
        true
    }

    async fn invoke(&self, method: SectionKind, request: &mut Request) -> ReturnCode;
}

/// A map processor, e.g. an LDAP or SQL search invoked by the `map`
/// keyword with a template argument and an inner map list.
#[async_trait]
pub trait MapProcessor: Send + Sync {
    fn name(&self) -> &str;

    async fn process(
        &self,
        expanded: Option<Value>,
        maps: &[AttrMap],
        request: &mut Request,
    ) -> ReturnCode;
}

/// The set of instantiated modules, read-only after startup.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn Module>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: Arc<dyn Module>) {
        self.modules.insert(module.name().to_string(), module);
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.modules.get(name).cloned()
    }
}

/// The set of named map processors.
#[derive(Default)]
pub struct MapRegistry {
    processors: HashMap<String, Arc<dyn MapProcessor>>,
}

impl MapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, processor: Arc<dyn MapProcessor>) {
        self.processors
            .insert(processor.name().to_string(), processor);
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn MapProcessor>> {
        self.processors.get(name).cloned()
    }
}

/// A module that unconditionally reports a fixed code, like the classic
/// `always` module. Useful for policy plumbing and for exercising action
/// tables in tests.
pub struct StaticModule {
    name: String,
    rcode: ReturnCode,
}

impl StaticModule {
    pub fn new(name: impl Into<String>, rcode: ReturnCode) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            rcode,
        })
    }
}

#[async_trait]
impl Module for StaticModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, _method: SectionKind, _request: &mut Request) -> ReturnCode {
        self.rcode
    }
}
