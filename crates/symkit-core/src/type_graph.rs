//! # Type Graphs
//!
//! A resolved type and everything it reaches, flattened into a pool. Nodes
//! refer to each other by [`TypeId`], so a struct holding a pointer to itself
//! is a back edge to an existing node rather than an infinite tree.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::arena::{Id, Pool};
use crate::backend::DebugInfo;
use crate::error::{Result, SymError};
use crate::types::{Member, Type, TypePayload, TypeRef};

/// Index of a node inside a [`TypeGraph`]
pub type TypeId = Id<TypeNode>;

/// A member together with the node of its type
#[derive(Debug, Clone, PartialEq)]
pub struct MemberNode
{
    pub member: Member,
    pub ty: Option<TypeId>,
}

/// One resolved type
#[derive(Debug, Clone, PartialEq)]
pub struct TypeNode
{
    pub ty: Type,
    /// Node of `ty.next`
    pub next: Option<TypeId>,
    /// Node of the owning class of a method or pointer-to-member
    pub owner: Option<TypeId>,
    pub members: Vec<MemberNode>,
    /// Breadth-first distance from the root
    pub depth: usize,
}

/// A root type and its reachable neighborhood
#[derive(Debug, Clone)]
pub struct TypeGraph
{
    nodes: Pool<TypeNode>,
    root: TypeId,
    truncated: bool,
}

struct Builder<'b, 'data>
{
    backend: &'b dyn DebugInfo<'data>,
    nodes: Pool<TypeNode>,
    visited: HashMap<TypeRef, TypeId>,
    queue: VecDeque<TypeId>,
}

impl<'data> Builder<'_, 'data>
{
    /// Node for `reference`, resolving and queueing it on first sight.
    fn intern(&mut self, reference: TypeRef, depth: usize) -> Result<TypeId>
    {
        if let Some(&id) = self.visited.get(&reference) {
            return Ok(id);
        }
        let ty = self.backend.resolve_type(reference)?;
        if let Some(&id) = self.visited.get(&ty.origin) {
            self.visited.insert(reference, id);
            return Ok(id);
        }
        let origin = ty.origin;
        let id = self.nodes.push(TypeNode {
            ty,
            next: None,
            owner: None,
            members: Vec::new(),
            depth,
        })?;
        self.visited.insert(reference, id);
        self.visited.insert(origin, id);
        self.queue.push_back(id);
        Ok(id)
    }

    /// Like [`Builder::intern`], but a child that fails to resolve becomes a
    /// dangling edge instead of failing the whole graph.
    fn child(&mut self, reference: TypeRef, depth: usize) -> Result<Option<TypeId>>
    {
        match self.intern(reference, depth) {
            Ok(id) => Ok(Some(id)),
            Err(err @ SymError::ResourceExhausted(_)) => Err(err),
            Err(err) => {
                debug!(reference = reference.0, %err, "unresolved type edge");
                Ok(None)
            }
        }
    }

    fn expand(&mut self, id: TypeId) -> Result<()>
    {
        let Some(node) = self.nodes.get(id) else {
            return Ok(());
        };
        let depth = node.depth + 1;
        let ty = node.ty.clone();

        let next = match ty.next {
            Some(reference) => self.child(reference, depth)?,
            None => None,
        };
        let owner = match ty.payload {
            TypePayload::Owner { class } => self.child(class, depth)?,
            _ => None,
        };
        let mut members = Vec::new();
        if ty.kind.has_members() {
            match self.backend.members(ty.origin) {
                Ok(iter) => {
                    for member in iter {
                        let member = match member {
                            Ok(member) => member,
                            Err(err) => {
                                debug!(origin = ty.origin.0, %err, "member list cut short");
                                break;
                            }
                        };
                        let node = match member.ty {
                            Some(reference) => self.child(reference, depth)?,
                            None => None,
                        };
                        members.push(MemberNode { member, ty: node });
                    }
                }
                Err(err) => debug!(origin = ty.origin.0, %err, "members unavailable"),
            }
        }

        if let Some(node) = self.nodes.get_mut(id) {
            node.next = next;
            node.owner = owner;
            node.members = members;
        }
        Ok(())
    }
}

impl TypeGraph
{
    /// Resolve `root` breadth-first through `backend`.
    ///
    /// Nodes at `max_depth` are resolved but not expanded; their edges stay
    /// `None` and [`TypeGraph::is_truncated`] reports it.
    pub fn resolve(backend: &dyn DebugInfo<'_>, root: TypeRef, max_depth: usize, pool_limit: usize) -> Result<Self>
    {
        let mut builder = Builder {
            backend,
            nodes: Pool::with_limit(pool_limit),
            visited: HashMap::new(),
            queue: VecDeque::new(),
        };
        let root = builder.intern(root, 0)?;
        let mut truncated = false;
        while let Some(id) = builder.queue.pop_front() {
            let at_limit = builder.nodes.get(id).is_some_and(|node| node.depth >= max_depth);
            if at_limit {
                truncated = true;
                continue;
            }
            builder.expand(id)?;
        }
        debug!(nodes = builder.nodes.len(), truncated, "resolved type graph");
        Ok(Self {
            nodes: builder.nodes,
            root,
            truncated,
        })
    }

    pub fn root(&self) -> TypeId
    {
        self.root
    }

    pub fn root_node(&self) -> Option<&TypeNode>
    {
        self.nodes.get(self.root)
    }

    pub fn node(&self, id: TypeId) -> Option<&TypeNode>
    {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize
    {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.nodes.is_empty()
    }

    /// Whether the depth bound stopped the traversal.
    pub fn is_truncated(&self) -> bool
    {
        self.truncated
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = (TypeId, &TypeNode)> + '_
    {
        self.nodes.iter()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::backend::{BackendKind, BoxIter, ModuleIndex};
    use crate::types::{Access, Arch, MemberKind, Module, ModuleId, Proc, TypeKind, Var};

    /// `struct Node { Node* next; }` with `Node*` at 1 and `Node` at 2
    struct Linked;

    impl<'data> DebugInfo<'data> for Linked
    {
        fn kind(&self) -> BackendKind
        {
            BackendKind::Null
        }

        fn arch(&self) -> Arch
        {
            Arch::X86_64
        }

        fn modules(&self) -> &[Module]
        {
            &[]
        }

        fn module_index(&self, _module: ModuleId) -> Result<&ModuleIndex<'data>>
        {
            Err(SymError::NoDebugInfo)
        }

        fn globals(&self, _module: ModuleId) -> Result<Vec<Var<'data>>>
        {
            Ok(Vec::new())
        }

        fn locals(&self, _proc: &Proc<'data>) -> Result<Vec<Var<'data>>>
        {
            Ok(Vec::new())
        }

        fn types(&self, _module: ModuleId) -> Result<Vec<TypeRef>>
        {
            Ok(vec![TypeRef(2)])
        }

        fn resolve_type(&self, reference: TypeRef) -> Result<Type>
        {
            match reference.0 {
                1 => {
                    let mut ty = Type::primitive(TypeKind::Pointer, 8, reference);
                    ty.next = Some(TypeRef(2));
                    Ok(ty)
                }
                2 => {
                    let mut ty = Type::primitive(TypeKind::Struct, 8, reference);
                    ty.name = Some("Node".into());
                    Ok(ty)
                }
                other => Err(SymError::malformed(format!("no type {other}"))),
            }
        }

        fn members<'s>(&'s self, _reference: TypeRef) -> Result<BoxIter<'s, Member>>
        {
            Ok(Box::new(std::iter::once(Ok(Member {
                name: Some("next".into()),
                ty: Some(TypeRef(1)),
                access: Access::Public,
                kind: MemberKind::Data { offset: 0 },
            }))))
        }
    }

    #[test]
    fn test_type_graph_self_reference_terminates()
    {
        let graph = TypeGraph::resolve(&Linked, TypeRef(1), 64, 16).unwrap();
        assert_eq!(graph.len(), 2);
        assert!(!graph.is_truncated());

        let pointer = graph.root_node().unwrap();
        assert_eq!(pointer.ty.kind, TypeKind::Pointer);
        let node = graph.node(pointer.next.unwrap()).unwrap();
        assert_eq!(node.ty.name.as_deref(), Some("Node"));
        assert_eq!(node.members[0].ty, Some(graph.root()));
    }

    #[test]
    fn test_type_graph_depth_bound()
    {
        let graph = TypeGraph::resolve(&Linked, TypeRef(1), 1, 16).unwrap();
        assert!(graph.is_truncated());
        let node = graph.node(graph.root_node().unwrap().next.unwrap()).unwrap();
        assert!(node.members.is_empty());
    }

    #[test]
    fn test_type_graph_pool_limit()
    {
        assert!(matches!(
            TypeGraph::resolve(&Linked, TypeRef(1), 64, 1),
            Err(SymError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_type_graph_unknown_root()
    {
        assert!(TypeGraph::resolve(&Linked, TypeRef(9), 64, 16).is_err());
    }
}
