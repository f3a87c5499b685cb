use rand::Rng;
use tracing::trace;

use crate::request::Request;
use crate::types::Value;
use crate::unlang::{apply_maps, Action, NodeId, NodeKind, ReturnCode, Tree};

struct ForeachState {
    values: Vec<Value>,
    index: usize,
    /// A loop variable is currently pushed on the request.
    active: bool,
}

struct LbState {
    start: usize,
    tried: usize,
}

/// One suspended position in the callable tree: the node, the child
/// cursor, the best (code, priority) seen so far, and per-kind iteration
/// state. Module invocations await with this stack intact, which is what
/// makes the interpreter resumable.
struct Frame {
    node: NodeId,
    cursor: usize,
    result: Option<ReturnCode>,
    priority: u8,
    if_taken: bool,
    foreach: Option<ForeachState>,
    lb: Option<LbState>,
    switch_done: bool,
}

impl Frame {
    fn enter(tree: &Tree, node: NodeId, request: &mut Request) -> Self {
        let mut frame = Self {
            node,
            cursor: 0,
            result: None,
            priority: 0,
            if_taken: false,
            foreach: None,
            lb: None,
            switch_done: false,
        };

        match &tree.node(node).kind {
            NodeKind::Foreach { template } => {
                let values = match template.attr_path() {
                    Some(path) => path.resolve_all(request),
                    None => Vec::new(),
                };
                let active = !values.is_empty();
                if active {
                    request.push_foreach(values[0].clone());
                }
                frame.foreach = Some(ForeachState {
                    values,
                    index: 0,
                    active,
                });
            }
            NodeKind::LoadBalance { .. } => {
                let n = tree.node(node).children.len().max(1);
                frame.lb = Some(LbState {
                    start: rand::thread_rng().gen_range(0..n),
                    tried: 0,
                });
            }
            _ => {}
        }

        frame
    }
}

enum Step {
    Push(NodeId),
    Invoke(NodeId),
    MapCall(NodeId),
    Update(NodeId),
    Xlat(NodeId),
    Break,
    Return,
    Done,
}

/// Walk a compiled tree against a request. The final return code is the
/// section's verdict.
pub async fn execute(tree: &Tree, request: &mut Request) -> ReturnCode {
    let mut stack: Vec<Frame> = vec![Frame::enter(tree, tree.root, request)];
    let mut completed: Option<(NodeId, ReturnCode)> = None;

    loop {
        // Feed a finished child into its parent's action resolution.
        if let Some((child, code)) = completed.take() {
            let Some(frame) = stack.last_mut() else {
                return code;
            };

            match tree.node(child).actions.get(code) {
                Action::Return | Action::Unset => {
                    let frame = pop_frame(&mut stack, request);
                    completed = Some((frame.node, code));
                    continue;
                }
                Action::Reject => {
                    trace!(node = %tree.node(child).name, %code, "action overrides to reject");
                    let frame = pop_frame(&mut stack, request);
                    completed = Some((frame.node, ReturnCode::Reject));
                    continue;
                }
                Action::Priority(p) => {
                    if p >= frame.priority {
                        frame.priority = p;
                        frame.result = Some(code);
                    }
                }
            }
        }

        let Some(frame) = stack.last_mut() else {
            return ReturnCode::Noop;
        };

        match next_step(tree, frame, request) {
            Step::Done => {
                let frame = pop_frame(&mut stack, request);
                let code = frame.result.unwrap_or(ReturnCode::Noop);
                completed = Some((frame.node, code));
            }

            Step::Push(id) => {
                let frame = Frame::enter(tree, id, request);
                stack.push(frame);
            }

            Step::Invoke(id) => {
                let node = tree.node(id);
                let NodeKind::Single { module } = &node.kind else {
                    unreachable!("Invoke only targets Single nodes");
                };
                trace!(module = %node.name, method = %node.method, "invoking module");
                let code = module.invoke(node.method, request).await;
                trace!(module = %node.name, %code, "module returned");
                completed = Some((id, code));
            }

            Step::MapCall(id) => {
                let node = tree.node(id);
                let NodeKind::Map {
                    processor,
                    template,
                    maps,
                } = &node.kind
                else {
                    unreachable!("MapCall only targets Map nodes");
                };
                let expanded = template.evaluate(request);
                let code = processor.process(expanded, maps, request).await;
                completed = Some((id, code));
            }

            Step::Update(id) => {
                let NodeKind::Update { maps } = &tree.node(id).kind else {
                    unreachable!("Update step only targets Update nodes");
                };
                apply_maps(maps, request);
                completed = Some((id, ReturnCode::Noop));
            }

            Step::Xlat(id) => {
                let NodeKind::Xlat { template } = &tree.node(id).kind else {
                    unreachable!("Xlat step only targets Xlat nodes");
                };
                // Expanded for side effect only; the accumulated result is
                // untouched.
                let _ = template.expand(request);
            }

            Step::Break => {
                // Unwind to the innermost foreach and stop its iteration.
                loop {
                    let Some(top) = stack.last() else {
                        return ReturnCode::Noop;
                    };
                    let is_foreach = matches!(tree.node(top.node).kind, NodeKind::Foreach { .. });
                    let frame = pop_frame(&mut stack, request);
                    if is_foreach {
                        let code = frame.result.unwrap_or(ReturnCode::Noop);
                        completed = Some((frame.node, code));
                        break;
                    }
                }
            }

            Step::Return => {
                // Exit the whole section with what we have so far.
                let mut code = ReturnCode::Noop;
                if let Some(top) = stack.last() {
                    code = top.result.unwrap_or(ReturnCode::Noop);
                }
                while !stack.is_empty() {
                    pop_frame(&mut stack, request);
                }
                return code;
            }
        }
    }
}

fn pop_frame(stack: &mut Vec<Frame>, request: &mut Request) -> Frame {
    let mut frame = stack.pop().expect("pop on empty interpreter stack");
    if let Some(state) = &mut frame.foreach {
        if state.active {
            request.pop_foreach();
            state.active = false;
        }
    }
    frame
}

fn next_step(tree: &Tree, frame: &mut Frame, request: &mut Request) -> Step {
    let node = tree.node(frame.node);

    // Foreach over nothing runs nothing.
    if let NodeKind::Foreach { .. } = &node.kind {
        let state = frame.foreach.as_ref().expect("foreach frame state");
        if state.values.is_empty() {
            return Step::Done;
        }
    }

    // Switch runs exactly one case.
    if let NodeKind::Switch { template } = &node.kind {
        if frame.switch_done {
            return Step::Done;
        }
        frame.switch_done = true;

        let value = template.evaluate(request);
        return match select_case(tree, &node.children, value.as_ref()) {
            Some(case) => Step::Push(case),
            None => Step::Done,
        };
    }

    // Load-balance picks pseudo-randomly; the redundant variant keeps
    // rotating while children keep failing.
    if let NodeKind::LoadBalance { redundant } = &node.kind {
        let state = frame.lb.as_mut().expect("load-balance frame state");
        let n = node.children.len();
        if n == 0 {
            return Step::Done;
        }

        let limit = if *redundant { n } else { 1 };
        if state.tried >= limit {
            return Step::Done;
        }

        let child = node.children[(state.start + state.tried) % n];
        state.tried += 1;
        return step_for_child(tree, child);
    }

    loop {
        let Some(&child) = node.children.get(frame.cursor) else {
            // Foreach advances to the next element before finishing.
            if let NodeKind::Foreach { .. } = &node.kind {
                let state = frame.foreach.as_mut().expect("foreach frame state");
                state.index += 1;
                if state.index < state.values.len() {
                    request.set_foreach(state.values[state.index].clone());
                    frame.cursor = 0;
                    frame.if_taken = false;
                    continue;
                }
            }
            return Step::Done;
        };

        match &tree.node(child).kind {
            NodeKind::If { condition, elsif } => {
                if *elsif && frame.if_taken {
                    frame.cursor += 1;
                    continue;
                }
                if condition.eval(request) {
                    frame.if_taken = true;
                    frame.cursor += 1;
                    return Step::Push(child);
                }
                frame.if_taken = false;
                frame.cursor += 1;
            }
            NodeKind::Else => {
                frame.cursor += 1;
                if frame.if_taken {
                    continue;
                }
                frame.if_taken = true;
                return Step::Push(child);
            }
            NodeKind::Break => return Step::Break,
            NodeKind::Return => return Step::Return,
            NodeKind::Single { .. } => {
                frame.cursor += 1;
                return Step::Invoke(child);
            }
            NodeKind::Update { .. } => {
                frame.cursor += 1;
                return Step::Update(child);
            }
            NodeKind::Map { .. } => {
                frame.cursor += 1;
                return Step::MapCall(child);
            }
            NodeKind::Xlat { .. } => {
                frame.cursor += 1;
                return Step::Xlat(child);
            }
            NodeKind::Case { .. } => {
                // Cases are only entered via their switch.
                frame.cursor += 1;
            }
            NodeKind::Group { .. }
            | NodeKind::LoadBalance { .. }
            | NodeKind::Switch { .. }
            | NodeKind::Foreach { .. } => {
                frame.cursor += 1;
                return Step::Push(child);
            }
        }
    }
}

/// The step that executes a child node, by kind.
fn step_for_child(tree: &Tree, child: NodeId) -> Step {
    match &tree.node(child).kind {
        NodeKind::Single { .. } => Step::Invoke(child),
        NodeKind::Update { .. } => Step::Update(child),
        NodeKind::Map { .. } => Step::MapCall(child),
        NodeKind::Xlat { .. } => Step::Xlat(child),
        NodeKind::Break => Step::Break,
        NodeKind::Return => Step::Return,
        _ => Step::Push(child),
    }
}

fn select_case(tree: &Tree, children: &[NodeId], value: Option<&Value>) -> Option<NodeId> {
    let mut default = None;

    for &child in children {
        let NodeKind::Case { value: case_value } = &tree.node(child).kind else {
            continue;
        };

        match (case_value, value) {
            (None, _) => default = Some(child),
            (Some(case_value), Some(value)) => {
                let matches = match case_value.cast(value.kind()) {
                    Ok(cast) => &cast == value,
                    Err(_) => case_value == value,
                };
                if matches {
                    return Some(child);
                }
            }
            (Some(_), None) => {}
        }
    }

    default
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::module::{MapProcessor, MapRegistry, Module, ModuleRegistry, StaticModule};
    use crate::unlang::{
        default_actions, parse_section, AttrMap, CompileCtx, Dictionary, GroupType, PolicyCatalog,
        SectionKind,
    };

    use super::*;

    fn registry() -> ModuleRegistry {
        let mut modules = ModuleRegistry::new();
        for code in ReturnCode::ALL {
            modules.register(StaticModule::new(format!("mod_{code}"), code));
        }
        modules
    }

    fn compile(src: &str, section: SectionKind) -> Tree {
        compile_with(src, section, &PolicyCatalog::new(), &MapRegistry::new())
    }

    fn compile_with(
        src: &str,
        section: SectionKind,
        policies: &PolicyCatalog,
        maps: &MapRegistry,
    ) -> Tree {
        let modules = registry();
        let dict = Dictionary::core();
        let ctx = CompileCtx {
            modules: &modules,
            maps,
            policies,
            dict: &dict,
        };
        let ast = parse_section(src).unwrap();
        ctx.compile(&ast, section).unwrap()
    }

    async fn run(src: &str, section: SectionKind, request: &mut Request) -> ReturnCode {
        let tree = compile(src, section);
        execute(&tree, request).await
    }

    fn named_request(user: &str) -> Request {
        let mut request = Request::new();
        request.packet.push("User-Name", Value::from(user));
        request
    }

    #[tokio::test]
    async fn if_elsif_else_chain() {
        let src = r#"
            authorize {
                if (&User-Name == "bob") {
                    mod_reject
                }
                elsif (&User-Name =~ /^carol/) {
                    mod_ok
                }
                else {
                    mod_noop
                }
            }
        "#;

        let mut bob = named_request("bob");
        assert_eq!(
            run(src, SectionKind::Authorize, &mut bob).await,
            ReturnCode::Reject
        );

        let mut carol = named_request("carol_2");
        assert_eq!(
            run(src, SectionKind::Authorize, &mut carol).await,
            ReturnCode::Ok
        );

        let mut dave = named_request("dave");
        assert_eq!(
            run(src, SectionKind::Authorize, &mut dave).await,
            ReturnCode::Noop
        );
    }

    #[tokio::test]
    async fn switch_matches_by_cast_value() {
        let src = r#"
            authorize {
                switch &Framed-IP-Address {
                    case 10.0.0.1 {
                        mod_noop
                    }
                    case {
                        mod_reject
                    }
                }
            }
        "#;

        let mut request = Request::new();
        request
            .packet
            .push("Framed-IP-Address", Value::Ipv4Addr([10, 0, 0, 1].into()));
        assert_eq!(
            run(src, SectionKind::Authorize, &mut request).await,
            ReturnCode::Noop
        );

        let mut request = Request::new();
        request
            .packet
            .push("Framed-IP-Address", Value::Ipv4Addr([10, 0, 0, 2].into()));
        assert_eq!(
            run(src, SectionKind::Authorize, &mut request).await,
            ReturnCode::Reject
        );
    }

    #[test]
    fn two_defaults_fail_to_compile() {
        let src = r#"
            authorize {
                switch &User-Name {
                    case {
                        mod_ok
                    }
                    case {
                        mod_reject
                    }
                }
            }
        "#;

        let modules = registry();
        let maps = MapRegistry::new();
        let policies = PolicyCatalog::new();
        let dict = Dictionary::core();
        let ctx = CompileCtx {
            modules: &modules,
            maps: &maps,
            policies: &policies,
            dict: &dict,
        };
        let ast = parse_section(src).unwrap();
        let err = ctx.compile(&ast, SectionKind::Authorize).unwrap_err();
        assert_eq!(err.to_string(), "Cannot have two 'default' case statements");
    }

    /// Counts how many times the loop body ran, optionally breaking at a
    /// particular value.
    struct CountingModule {
        name: String,
        count: std::sync::Mutex<u32>,
    }

    impl CountingModule {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                count: std::sync::Mutex::new(0),
            })
        }

        fn count(&self) -> u32 {
            *self.count.lock().unwrap()
        }
    }

    #[async_trait]
    impl Module for CountingModule {
        fn name(&self) -> &str {
            &self.name
        }

        async fn invoke(&self, _method: SectionKind, _request: &mut Request) -> ReturnCode {
            *self.count.lock().unwrap() += 1;
            ReturnCode::Ok
        }
    }

    #[tokio::test]
    async fn foreach_runs_body_per_element() {
        let counter = CountingModule::new("counter");
        let mut modules = registry();
        modules.register(counter.clone());

        let src = r#"
            authorize {
                foreach &Reply-Message {
                    counter
                }
            }
        "#;

        let dict = Dictionary::core();
        let maps = MapRegistry::new();
        let policies = PolicyCatalog::new();
        let ctx = CompileCtx {
            modules: &modules,
            maps: &maps,
            policies: &policies,
            dict: &dict,
        };
        let tree = ctx
            .compile(&parse_section(src).unwrap(), SectionKind::Authorize)
            .unwrap();

        let mut request = Request::new();
        for text in ["a", "b", "c", "d"] {
            request.packet.push("Reply-Message", Value::from(text));
        }

        execute(&tree, &mut request).await;
        assert_eq!(counter.count(), 4);
        assert_eq!(request.foreach_depth(), 0);
    }

    #[tokio::test]
    async fn foreach_break_stops_early() {
        let counter = CountingModule::new("counter");
        let mut modules = registry();
        modules.register(counter.clone());

        // Break fires on the element at index 2: the body runs 3 times.
        let src = r#"
            authorize {
                foreach &Reply-Message {
                    counter
                    if (&Foreach-Variable-0 == "stop") {
                        break
                    }
                }
            }
        "#;

        let dict = Dictionary::core();
        let maps = MapRegistry::new();
        let policies = PolicyCatalog::new();
        let ctx = CompileCtx {
            modules: &modules,
            maps: &maps,
            policies: &policies,
            dict: &dict,
        };
        let tree = ctx
            .compile(&parse_section(src).unwrap(), SectionKind::Authorize)
            .unwrap();

        let mut request = Request::new();
        for text in ["a", "b", "stop", "d", "e"] {
            request.packet.push("Reply-Message", Value::from(text));
        }

        execute(&tree, &mut request).await;
        assert_eq!(counter.count(), 3);
        assert_eq!(request.foreach_depth(), 0);
    }

    #[tokio::test]
    async fn redundant_falls_through_on_fail() {
        let src = r#"
            authorize {
                redundant {
                    mod_fail
                    mod_ok
                }
            }
        "#;

        let mut request = Request::new();
        assert_eq!(
            run(src, SectionKind::Authorize, &mut request).await,
            ReturnCode::Ok
        );
    }

    #[tokio::test]
    async fn redundant_all_fail_reports_fail() {
        let src = r#"
            authorize {
                redundant {
                    mod_fail
                    mod_fail
                }
            }
        "#;

        let mut request = Request::new();
        assert_eq!(
            run(src, SectionKind::Authorize, &mut request).await,
            ReturnCode::Fail
        );
    }

    #[tokio::test]
    async fn load_balance_picks_exactly_one() {
        let a = CountingModule::new("lb_a");
        let b = CountingModule::new("lb_b");
        let mut modules = registry();
        modules.register(a.clone());
        modules.register(b.clone());

        let src = r#"
            authorize {
                load-balance {
                    lb_a
                    lb_b
                }
            }
        "#;

        let dict = Dictionary::core();
        let maps = MapRegistry::new();
        let policies = PolicyCatalog::new();
        let ctx = CompileCtx {
            modules: &modules,
            maps: &maps,
            policies: &policies,
            dict: &dict,
        };
        let tree = ctx
            .compile(&parse_section(src).unwrap(), SectionKind::Authorize)
            .unwrap();

        for _ in 0..8 {
            let mut request = Request::new();
            assert_eq!(execute(&tree, &mut request).await, ReturnCode::Ok);
        }
        assert_eq!(a.count() + b.count(), 8);
    }

    #[tokio::test]
    async fn update_block_modifies_reply() {
        let src = r#"
            authorize {
                update {
                    &reply:Reply-Message := "hello"
                }
                mod_ok
            }
        "#;

        let mut request = Request::new();
        let code = run(src, SectionKind::Authorize, &mut request).await;
        assert_eq!(code, ReturnCode::Ok);
        assert_eq!(request.reply.get("Reply-Message"), Some(&Value::from("hello")));
    }

    #[tokio::test]
    async fn policy_reference_compiles_inline() {
        let policy_src = r#"
            policy {
                my_policy {
                    mod_updated
                }
            }
        "#;
        let policies =
            PolicyCatalog::from_section(&parse_section(policy_src).unwrap());

        let src = r#"
            authorize {
                my_policy
            }
        "#;

        let tree = compile_with(src, SectionKind::Authorize, &policies, &MapRegistry::new());
        let mut request = Request::new();
        assert_eq!(
            execute(&tree, &mut request).await,
            ReturnCode::Updated
        );
    }

    #[tokio::test]
    async fn cyclic_policy_falls_through_to_module() {
        // The policy "mod_ok" references itself; the inner reference must
        // resolve to the module of the same name instead of recursing.
        let policy_src = r#"
            policy {
                mod_ok {
                    mod_ok
                }
            }
        "#;
        let policies =
            PolicyCatalog::from_section(&parse_section(policy_src).unwrap());

        let src = r#"
            authorize {
                mod_ok
            }
        "#;

        let tree = compile_with(src, SectionKind::Authorize, &policies, &MapRegistry::new());
        let mut request = Request::new();
        assert_eq!(execute(&tree, &mut request).await, ReturnCode::Ok);
    }

    #[tokio::test]
    async fn action_override_changes_result() {
        let src = r#"
            authorize {
                mod_fail {
                    fail = 1
                }
                mod_ok
            }
        "#;

        let mut request = Request::new();
        assert_eq!(
            run(src, SectionKind::Authorize, &mut request).await,
            ReturnCode::Ok
        );
    }

    #[tokio::test]
    async fn reject_action_overrides_code() {
        let src = r#"
            authorize {
                mod_notfound {
                    notfound = reject
                }
            }
        "#;

        let mut request = Request::new();
        assert_eq!(
            run(src, SectionKind::Authorize, &mut request).await,
            ReturnCode::Reject
        );
    }

    #[tokio::test]
    async fn return_exits_section_with_accumulated_code() {
        let src = r#"
            authorize {
                mod_updated
                return
                mod_reject
            }
        "#;

        let mut request = Request::new();
        assert_eq!(
            run(src, SectionKind::Authorize, &mut request).await,
            ReturnCode::Updated
        );
    }

    /// Reference model for a flat group: apply each child's action in
    /// order against the accumulated (code, priority).
    fn reference_group(codes: &[ReturnCode], section: SectionKind) -> ReturnCode {
        let table = default_actions(section, GroupType::Simple);
        let mut result = None;
        let mut priority = 0u8;

        for &code in codes {
            match table.get(code) {
                Action::Return | Action::Unset => return code,
                Action::Reject => return ReturnCode::Reject,
                Action::Priority(p) => {
                    if p >= priority {
                        priority = p;
                        result = Some(code);
                    }
                }
            }
        }
        result.unwrap_or(ReturnCode::Noop)
    }

    #[tokio::test]
    async fn authorize_action_table_truth_test() {
        // Enumerate all 9^3 child-code triples against the reference
        // model for the authorize defaults.
        for a in ReturnCode::ALL {
            for b in ReturnCode::ALL {
                for c in ReturnCode::ALL {
                    let src = format!(
                        "authorize {{\n  mod_{a}\n  mod_{b}\n  mod_{c}\n}}\n"
                    );
                    let mut request = Request::new();
                    let got = run(&src, SectionKind::Authorize, &mut request).await;
                    let want = reference_group(&[a, b, c], SectionKind::Authorize);
                    assert_eq!(got, want, "codes ({a}, {b}, {c})");
                }
            }
        }
    }

    #[tokio::test]
    async fn fail_short_circuits_ok_and_updated() {
        // fail = Return in authorize: the first child short-circuits.
        let src = r#"
            authorize {
                mod_fail
                mod_ok
                mod_updated
            }
        "#;

        let mut request = Request::new();
        assert_eq!(
            run(src, SectionKind::Authorize, &mut request).await,
            ReturnCode::Fail
        );
    }

    struct EchoMap;

    #[async_trait]
    impl MapProcessor for EchoMap {
        fn name(&self) -> &str {
            "echo"
        }

        async fn process(
            &self,
            expanded: Option<Value>,
            maps: &[AttrMap],
            request: &mut Request,
        ) -> ReturnCode {
            if let Some(value) = expanded {
                request.control.push("Class", value);
            }
            apply_maps(maps, request);
            ReturnCode::Updated
        }
    }

    #[tokio::test]
    async fn map_node_invokes_processor() {
        let mut maps = MapRegistry::new();
        maps.register(Arc::new(EchoMap));

        let src = r#"
            authorize {
                map echo &User-Name {
                    &reply:Reply-Message := "mapped"
                }
            }
        "#;

        let tree = compile_with(src, SectionKind::Authorize, &PolicyCatalog::new(), &maps);
        let mut request = named_request("alice");
        let code = execute(&tree, &mut request).await;

        assert_eq!(code, ReturnCode::Updated);
        assert_eq!(request.control.get("Class"), Some(&Value::from("alice")));
        assert_eq!(request.reply.get("Reply-Message"), Some(&Value::from("mapped")));
    }

    #[tokio::test]
    async fn authtype_override_applies_at_depth() {
        // Inside authenticate, ok gets priority 2 (not Return), so a
        // later updated (priority 4) wins even from a nested group.
        let src = r#"
            authenticate {
                group {
                    mod_ok
                    mod_updated
                }
            }
        "#;

        let mut request = Request::new();
        assert_eq!(
            run(src, SectionKind::Authenticate, &mut request).await,
            ReturnCode::Updated
        );
    }

    #[tokio::test]
    async fn pruned_false_if_never_runs() {
        let src = r#"
            authorize {
                if (0) {
                    mod_reject
                }
                mod_ok
            }
        "#;

        let mut request = Request::new();
        assert_eq!(
            run(src, SectionKind::Authorize, &mut request).await,
            ReturnCode::Ok
        );
    }
}
