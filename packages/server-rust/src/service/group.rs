//! Middleware groups: a tree of named nodes, each owning ordered
//! pre-processing steps that run before its handlers and proxy rules.
//!
//! A group's effective chain is every ancestor's steps, root first, followed
//! by its own.

use std::sync::Arc;

use async_trait::async_trait;
use meshrpc_core::{Request, RpcError};

use super::binding::RegistrationError;
use super::context::CallContext;

// ---------------------------------------------------------------------------
// PreProcess
// ---------------------------------------------------------------------------

/// One pre-processing step. The first step that fails short-circuits the
/// call with its error.
#[async_trait]
pub trait PreProcess: Send + Sync + 'static {
    async fn run(&self, ctx: &mut CallContext, request: &Request) -> Result<(), RpcError>;
}

struct FnPreProcess<F>(F);

#[async_trait]
impl<F> PreProcess for FnPreProcess<F>
where
    F: Fn(&mut CallContext, &Request) -> Result<(), RpcError> + Send + Sync + 'static,
{
    async fn run(&self, ctx: &mut CallContext, request: &Request) -> Result<(), RpcError> {
        (self.0)(ctx, request)
    }
}

/// Adapts a synchronous closure into a [`PreProcess`] step.
pub fn pre_process_fn<F>(f: F) -> impl PreProcess
where
    F: Fn(&mut CallContext, &Request) -> Result<(), RpcError> + Send + Sync + 'static,
{
    FnPreProcess(f)
}

// ---------------------------------------------------------------------------
// GroupTree
// ---------------------------------------------------------------------------

/// Index of a group inside its router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(pub(crate) usize);

impl GroupId {
    pub const ROOT: GroupId = GroupId(0);
}

struct GroupNode {
    name: String,
    parent: Option<GroupId>,
    steps: Vec<Arc<dyn PreProcess>>,
}

/// Arena holding every group of a router. Nodes are never removed.
pub(crate) struct GroupTree {
    nodes: Vec<GroupNode>,
}

impl GroupTree {
    pub(crate) fn new() -> Self {
        Self {
            nodes: vec![GroupNode {
                name: String::new(),
                parent: None,
                steps: Vec::new(),
            }],
        }
    }

    fn node(&self, id: GroupId) -> Result<&GroupNode, RegistrationError> {
        self.nodes
            .get(id.0)
            .ok_or(RegistrationError::UnknownGroup(id.0))
    }

    pub(crate) fn contains(&self, id: GroupId) -> bool {
        id.0 < self.nodes.len()
    }

    pub(crate) fn add_child(
        &mut self,
        parent: GroupId,
        name: &str,
    ) -> Result<GroupId, RegistrationError> {
        self.node(parent)?;
        let id = GroupId(self.nodes.len());
        self.nodes.push(GroupNode {
            name: name.to_string(),
            parent: Some(parent),
            steps: Vec::new(),
        });
        Ok(id)
    }

    pub(crate) fn push_step(
        &mut self,
        id: GroupId,
        step: Arc<dyn PreProcess>,
    ) -> Result<(), RegistrationError> {
        let node = self
            .nodes
            .get_mut(id.0)
            .ok_or(RegistrationError::UnknownGroup(id.0))?;
        node.steps.push(step);
        Ok(())
    }

    /// Effective chain for `id`, root-most ancestor first.
    pub(crate) fn chain(&self, id: GroupId) -> Vec<Arc<dyn PreProcess>> {
        let mut lineage = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(node) = self.nodes.get(current.0) else {
                break;
            };
            lineage.push(node);
            cursor = node.parent;
        }
        lineage
            .iter()
            .rev()
            .flat_map(|node| node.steps.iter().cloned())
            .collect()
    }

    /// Slash-joined path of group names, `/` for the root.
    pub(crate) fn path(&self, id: GroupId) -> String {
        let mut names = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(node) = self.nodes.get(current.0) else {
                break;
            };
            if !node.name.is_empty() {
                names.push(node.name.as_str());
            }
            cursor = node.parent;
        }
        names.reverse();
        format!("/{}", names.join("/"))
    }
}

/// Runs `chain` in order against the call, stopping at the first failure.
pub(crate) async fn run_chain(
    chain: &[Arc<dyn PreProcess>],
    ctx: &mut CallContext,
    request: &Request,
) -> Result<(), RpcError> {
    for step in chain {
        step.run(ctx, request).await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    fn recording(log: &Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> Arc<dyn PreProcess> {
        let log = Arc::clone(log);
        Arc::new(pre_process_fn(move |_ctx, _req| {
            log.lock().push(label);
            Ok(())
        }))
    }

    #[tokio::test]
    async fn chain_runs_ancestors_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tree = GroupTree::new();
        let api = tree.add_child(GroupId::ROOT, "api").unwrap();
        let v1 = tree.add_child(api, "v1").unwrap();

        tree.push_step(v1, recording(&log, "v1")).unwrap();
        tree.push_step(GroupId::ROOT, recording(&log, "root")).unwrap();
        tree.push_step(api, recording(&log, "api-1")).unwrap();
        tree.push_step(api, recording(&log, "api-2")).unwrap();

        let chain = tree.chain(v1);
        let mut ctx = CallContext::new();
        run_chain(&chain, &mut ctx, &Request::default()).await.unwrap();

        assert_eq!(*log.lock(), vec!["root", "api-1", "api-2", "v1"]);
    }

    #[tokio::test]
    async fn first_failure_short_circuits() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tree = GroupTree::new();
        let g = tree.add_child(GroupId::ROOT, "g").unwrap();
        tree.push_step(
            g,
            Arc::new(pre_process_fn(|_ctx, _req| {
                Err(RpcError::named("DENIED", "no access"))
            })),
        )
        .unwrap();
        tree.push_step(g, recording(&log, "after")).unwrap();

        let mut ctx = CallContext::new();
        let err = run_chain(&tree.chain(g), &mut ctx, &Request::default())
            .await
            .unwrap_err();
        assert!(err.has_code("DENIED"));
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn steps_can_annotate_context() {
        let mut tree = GroupTree::new();
        tree.push_step(
            GroupId::ROOT,
            Arc::new(pre_process_fn(|ctx, req| {
                ctx.set_value("service", req.req_service.clone());
                Ok(())
            })),
        )
        .unwrap();
        let mut ctx = CallContext::new();
        run_chain(&tree.chain(GroupId::ROOT), &mut ctx, &Request::new("billing", "Pay"))
            .await
            .unwrap();
        assert_eq!(ctx.value("service"), Some("billing"));
    }

    #[test]
    fn paths_and_unknown_groups() {
        let mut tree = GroupTree::new();
        let a = tree.add_child(GroupId::ROOT, "a").unwrap();
        let b = tree.add_child(a, "b").unwrap();
        assert_eq!(tree.path(GroupId::ROOT), "/");
        assert_eq!(tree.path(b), "/a/b");
        assert_eq!(
            tree.add_child(GroupId(99), "x"),
            Err(RegistrationError::UnknownGroup(99))
        );
        assert!(!tree.contains(GroupId(99)));
    }
}
