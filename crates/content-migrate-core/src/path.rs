use serde::{Deserialize, Serialize};

use crate::{EntityTypeTag, IdResolver, LegacyId, MigrateError, NodeTypeLookup, Resolution};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Literal(&'static str),
    /// The legacy id to resolve.
    Id,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathTarget {
    /// The node bundle is discovered from the legacy node table.
    Node,
    Fixed(EntityTypeTag),
}

/// One whitelisted internal path shape. Segments after the pattern are kept verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathRule {
    pub pattern: &'static [Segment],
    pub target: PathTarget,
}

/// Path prefix dispatch table. Anything not listed (including `file/<id>`) passes through.
pub const PATH_RULES: &[PathRule] = &[
    PathRule { pattern: &[Segment::Literal("node"), Segment::Id], target: PathTarget::Node },
    PathRule {
        pattern: &[Segment::Literal("taxonomy"), Segment::Literal("term"), Segment::Id],
        target: PathTarget::Fixed(EntityTypeTag::TaxonomyTerm),
    },
    PathRule {
        pattern: &[Segment::Literal("taxonomy"), Segment::Id, Segment::Literal("term")],
        target: PathTarget::Fixed(EntityTypeTag::TaxonomyTerm),
    },
    PathRule {
        pattern: &[Segment::Literal("user"), Segment::Id],
        target: PathTarget::Fixed(EntityTypeTag::User),
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PathRewrite {
    Rewritten { path: String },
    /// Unsupported prefix, malformed shape, or a target that does not exist in the legacy store.
    PassThrough { path: String },
    /// The target exists but has not been migrated yet.
    Unresolved { path: String, entity_type: EntityTypeTag, legacy_id: LegacyId },
}

impl PathRewrite {
    /// The path to emit: rewritten when possible, otherwise the input unchanged.
    #[must_use]
    pub fn into_path(self) -> String {
        match self {
            Self::Rewritten { path } | Self::PassThrough { path } | Self::Unresolved { path, .. } => {
                path
            }
        }
    }
}

pub struct PathRewriter<'a> {
    resolver: IdResolver<'a>,
    nodes: &'a dyn NodeTypeLookup,
}

impl<'a> PathRewriter<'a> {
    #[must_use]
    pub fn new(resolver: IdResolver<'a>, nodes: &'a dyn NodeTypeLookup) -> Self {
        Self { resolver, nodes }
    }

    /// Rewrite `path`, leaving it unchanged when it cannot be rewritten.
    ///
    /// # Errors
    /// Propagates identifier map and node-type lookup failures.
    pub fn rewrite(&self, path: &str) -> Result<String, MigrateError> {
        let outcome = self.classify(path)?;
        if let PathRewrite::Unresolved { entity_type, legacy_id, .. } = &outcome {
            tracing::warn!(path, %entity_type, legacy_id = legacy_id.0, "path target not migrated yet; left unchanged");
        }
        Ok(outcome.into_path())
    }

    /// Rewrite `path` and report how it was handled.
    ///
    /// # Errors
    /// Propagates identifier map and node-type lookup failures.
    pub fn classify(&self, path: &str) -> Result<PathRewrite, MigrateError> {
        let segments: Vec<&str> = path.split('/').collect();
        let Some((rule, index, legacy_id)) = match_rule(&segments) else {
            let known_prefix = PATH_RULES.iter().any(|rule| {
                matches!(rule.pattern.first(), Some(Segment::Literal(literal)) if Some(literal) == segments.first())
            });
            if known_prefix {
                tracing::warn!(path, "malformed internal path passed through");
            }
            return Ok(PathRewrite::PassThrough { path: path.to_string() });
        };

        if legacy_id.is_none() {
            return Ok(PathRewrite::PassThrough { path: path.to_string() });
        }

        let entity_type = match rule.target {
            PathTarget::Fixed(entity_type) => entity_type,
            PathTarget::Node => match self.nodes.node_type(legacy_id)? {
                Some(entity_type) => entity_type,
                None => {
                    tracing::debug!(path, "no migrated legacy node for path; passed through");
                    return Ok(PathRewrite::PassThrough { path: path.to_string() });
                }
            },
        };

        match self.resolver.resolve(entity_type, legacy_id)? {
            Resolution::Resolved(new_id) => {
                let replacement = new_id.to_string();
                let rewritten: Vec<&str> = segments
                    .iter()
                    .enumerate()
                    .map(|(position, segment)| {
                        if position == index {
                            replacement.as_str()
                        } else {
                            *segment
                        }
                    })
                    .collect();
                Ok(PathRewrite::Rewritten { path: rewritten.join("/") })
            }
            Resolution::Unresolved => {
                Ok(PathRewrite::Unresolved { path: path.to_string(), entity_type, legacy_id })
            }
        }
    }
}

/// First rule whose literals match and whose id segment parses.
fn match_rule(segments: &[&str]) -> Option<(&'static PathRule, usize, LegacyId)> {
    PATH_RULES.iter().find_map(|rule| {
        if segments.len() < rule.pattern.len() {
            return None;
        }
        let mut id = None;
        for (index, (segment, expected)) in segments.iter().zip(rule.pattern).enumerate() {
            match expected {
                Segment::Literal(literal) if segment == literal => {}
                Segment::Literal(_) => return None,
                Segment::Id => {
                    let parsed = segment.parse::<u32>().ok()?;
                    id = Some((index, LegacyId(parsed)));
                }
            }
        }
        id.map(|(index, legacy_id)| (rule, index, legacy_id))
    })
}
