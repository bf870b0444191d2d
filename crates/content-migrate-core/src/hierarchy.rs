use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    EntityTypeTag, IdResolver, LegacyId, LegacyRow, LinkId, MigrateError, NewId,
    ParentContentLookup, Resolution,
};

/// Width of the legacy materialized path (`p1`..`p9`), which bounds tree depth.
pub const MAX_TREE_DEPTH: usize = 9;

/// Row columns carrying one legacy outline position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyColumns {
    pub link: String,
    pub parent_link: String,
    pub depth: String,
    pub weight: String,
    /// Legacy id of the tree's root entity.
    pub tree: String,
    /// Materialized path columns, outermost ancestor first.
    pub path: Vec<String>,
}

impl HierarchyColumns {
    /// Column names of the legacy `book` ⋈ `menu_links` outline.
    #[must_use]
    pub fn outline() -> Self {
        Self {
            link: "mlid".to_string(),
            parent_link: "plid".to_string(),
            depth: "depth".to_string(),
            weight: "weight".to_string(),
            tree: "bid".to_string(),
            path: (1..=MAX_TREE_DEPTH).map(|index| format!("p{index}")).collect(),
        }
    }
}

/// One position in a legacy tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyNode {
    pub link_id: LinkId,
    pub parent_link_id: LinkId,
    pub depth: u8,
    /// Ancestor link ids from the root down to (and including) this link.
    pub path: Vec<LinkId>,
    pub weight: i64,
    pub entity_id: LegacyId,
    pub tree_id: LegacyId,
}

impl HierarchyNode {
    /// Reads a node from a legacy row. Trailing `0` path slots are dropped.
    ///
    /// # Errors
    /// Returns [`MigrateError::Validation`] when a column is missing or out of range.
    pub fn from_row(
        row: &LegacyRow,
        columns: &HierarchyColumns,
        entity_id: LegacyId,
    ) -> Result<Self, MigrateError> {
        let depth = row.integer(&columns.depth)?;
        let depth = u8::try_from(depth)
            .ok()
            .filter(|depth| usize::from(*depth) <= MAX_TREE_DEPTH)
            .ok_or_else(|| MigrateError::Validation(format!("tree depth out of range: {depth}")))?;

        let mut path = Vec::with_capacity(MAX_TREE_DEPTH);
        for column in columns.path.iter().take(MAX_TREE_DEPTH) {
            let link = row.link(column)?;
            if link.is_root() {
                break;
            }
            path.push(link);
        }

        Ok(Self {
            link_id: row.link(&columns.link)?,
            parent_link_id: row.link(&columns.parent_link)?,
            depth,
            path,
            weight: row.integer(&columns.weight)?,
            entity_id,
            tree_id: row.id(&columns.tree)?,
        })
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_link_id.is_root()
    }

    /// Ancestor links nearest first, taken from the materialized path when it
    /// agrees with the parent pointer.
    fn path_ancestors(&self) -> Option<Vec<LinkId>> {
        let depth = usize::from(self.depth);
        if depth < 2 || self.path.len() < depth {
            return None;
        }
        if self.path[depth - 1] != self.link_id || self.path[depth - 2] != self.parent_link_id {
            return None;
        }
        Some(self.path[..depth - 1].iter().rev().copied().collect())
    }
}

/// Root entity of the tree a node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "new_id", rename_all = "snake_case")]
pub enum TreeRef {
    /// The node roots its own tree; the id is known only once the destination assigns it.
    OwnRoot,
    Entity(NewId),
}

impl TreeRef {
    /// New id of the tree root, given the node's own assigned id.
    #[must_use]
    pub fn new_id(self, own: NewId) -> NewId {
        match self {
            Self::OwnRoot => own,
            Self::Entity(new_id) => new_id,
        }
    }
}

/// Parent reference handed to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedHierarchy {
    /// `0` for tree roots.
    pub parent_new_id: NewId,
    pub tree: TreeRef,
    pub depth: u8,
    pub weight: i64,
}

impl ResolvedHierarchy {
    /// Replace [`TreeRef::OwnRoot`] with the id the destination assigned to this node.
    pub fn assign(&mut self, own: NewId) {
        self.tree = TreeRef::Entity(self.tree.new_id(own));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HierarchyOutcome {
    Resolved(ResolvedHierarchy),
    /// A content ancestor (or the tree root) exists but has not been migrated yet.
    Deferred { legacy_id: LegacyId },
}

pub struct HierarchyReconstructor<'a> {
    resolver: IdResolver<'a>,
    lookup: &'a dyn ParentContentLookup,
}

impl<'a> HierarchyReconstructor<'a> {
    #[must_use]
    pub fn new(resolver: IdResolver<'a>, lookup: &'a dyn ParentContentLookup) -> Self {
        Self { resolver, lookup }
    }

    /// Resolve the destination parent of `node`.
    ///
    /// # Errors
    /// Propagates identifier map and tree-lookup failures.
    pub fn reconstruct_parent(
        &self,
        node: &HierarchyNode,
        entity_type: EntityTypeTag,
    ) -> Result<HierarchyOutcome, MigrateError> {
        if node.is_root() {
            return Ok(HierarchyOutcome::Resolved(ResolvedHierarchy {
                parent_new_id: NewId::NONE,
                tree: TreeRef::OwnRoot,
                depth: node.depth,
                weight: node.weight,
            }));
        }

        let parent_new_id = match self.nearest_content_ancestor(node)? {
            None => {
                tracing::debug!(
                    link_id = node.link_id.0,
                    "no content ancestor found; treating node as a tree root"
                );
                NewId::NONE
            }
            Some(ancestor) => match self.resolver.resolve(entity_type, ancestor)? {
                Resolution::Resolved(new_id) => new_id,
                Resolution::Unresolved => {
                    tracing::debug!(
                        entity_id = node.entity_id.0,
                        ancestor = ancestor.0,
                        "parent not migrated yet; deferring"
                    );
                    return Ok(HierarchyOutcome::Deferred { legacy_id: ancestor });
                }
            },
        };

        let tree = if node.tree_id == node.entity_id || node.tree_id.is_none() {
            TreeRef::OwnRoot
        } else {
            match self.resolver.resolve(entity_type, node.tree_id)? {
                Resolution::Resolved(new_id) => TreeRef::Entity(new_id),
                Resolution::Unresolved => {
                    return Ok(HierarchyOutcome::Deferred { legacy_id: node.tree_id });
                }
            }
        };

        Ok(HierarchyOutcome::Resolved(ResolvedHierarchy {
            parent_new_id,
            tree,
            depth: node.depth,
            weight: node.weight,
        }))
    }

    /// Legacy entity id of the nearest ancestor link that carries content.
    fn nearest_content_ancestor(
        &self,
        node: &HierarchyNode,
    ) -> Result<Option<LegacyId>, MigrateError> {
        if let Some(ancestors) = node.path_ancestors() {
            for link_id in ancestors {
                if let Some(entity_id) = self.content_of(link_id)? {
                    return Ok(Some(entity_id));
                }
            }
            return Ok(None);
        }

        // Pointer walk for rows whose materialized path is missing or stale.
        let mut visited = BTreeSet::from([node.link_id]);
        let mut current = node.parent_link_id;
        for _ in 0..MAX_TREE_DEPTH {
            if current.is_root() || !visited.insert(current) {
                break;
            }
            let Some(link) = self.lookup.link(current)? else {
                break;
            };
            if let Some(entity_id) = link.entity_id.filter(|id| !id.is_none()) {
                return Ok(Some(entity_id));
            }
            current = link.parent_link_id;
        }
        Ok(None)
    }

    fn content_of(&self, link_id: LinkId) -> Result<Option<LegacyId>, MigrateError> {
        Ok(self
            .lookup
            .link(link_id)?
            .and_then(|link| link.entity_id)
            .filter(|id| !id.is_none()))
    }
}
