use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::MigrateError;

/// Key space partition for identifier mappings.
///
/// The set is closed: every tag maps to exactly one mapping partition through
/// [`EntityTypeTag::partition`], so no partition name is ever assembled at lookup time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EntityTypeTag {
    #[serde(rename = "taxonomy_vocabulary")]
    TaxonomyVocabulary,
    #[serde(rename = "taxonomy_term")]
    TaxonomyTerm,
    #[serde(rename = "user")]
    User,
    #[serde(rename = "file")]
    File,
    #[serde(rename = "node:article")]
    NodeArticle,
    #[serde(rename = "node:page")]
    NodePage,
    #[serde(rename = "node:website")]
    NodeWebsite,
    #[serde(rename = "node:book")]
    NodeBook,
    #[serde(rename = "comment")]
    Comment,
    #[serde(rename = "url_alias")]
    UrlAlias,
}

impl EntityTypeTag {
    pub const ALL: [Self; 10] = [
        Self::TaxonomyVocabulary,
        Self::TaxonomyTerm,
        Self::User,
        Self::File,
        Self::NodeArticle,
        Self::NodePage,
        Self::NodeWebsite,
        Self::NodeBook,
        Self::Comment,
        Self::UrlAlias,
    ];

    pub const NODES: [Self; 4] =
        [Self::NodeArticle, Self::NodePage, Self::NodeWebsite, Self::NodeBook];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaxonomyVocabulary => "taxonomy_vocabulary",
            Self::TaxonomyTerm => "taxonomy_term",
            Self::User => "user",
            Self::File => "file",
            Self::NodeArticle => "node:article",
            Self::NodePage => "node:page",
            Self::NodeWebsite => "node:website",
            Self::NodeBook => "node:book",
            Self::Comment => "comment",
            Self::UrlAlias => "url_alias",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.as_str() == value)
    }

    /// Name of the mapping-store partition holding this type's mappings.
    #[must_use]
    pub fn partition(self) -> &'static str {
        match self {
            Self::TaxonomyVocabulary => "taxonomy_vocabulary",
            Self::TaxonomyTerm => "taxonomy_term",
            Self::User => "user",
            Self::File => "file",
            Self::NodeArticle => "node_article",
            Self::NodePage => "node_page",
            Self::NodeWebsite => "node_website",
            Self::NodeBook => "node_book",
            Self::Comment => "comment",
            Self::UrlAlias => "url_alias",
        }
    }

    #[must_use]
    pub fn from_partition(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.partition() == value)
    }

    /// Legacy `node.type` bundle name for node tags.
    #[must_use]
    pub fn node_bundle(self) -> Option<&'static str> {
        match self {
            Self::NodeArticle => Some("article"),
            Self::NodePage => Some("page"),
            Self::NodeWebsite => Some("website"),
            Self::NodeBook => Some("book"),
            _ => None,
        }
    }

    #[must_use]
    pub fn from_node_bundle(bundle: &str) -> Option<Self> {
        Self::NODES.into_iter().find(|tag| tag.node_bundle() == Some(bundle))
    }

    #[must_use]
    pub fn is_node(self) -> bool {
        self.node_bundle().is_some()
    }
}

impl Display for EntityTypeTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityTypeTag {
    type Err = MigrateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
            .ok_or_else(|| MigrateError::Validation(format!("unknown entity type: {value}")))
    }
}

/// Identifier of an entity in the legacy schema.
///
/// `0` is the legacy "none/root" sentinel ([`LegacyId::NONE`]); it never names an entity.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(transparent)]
pub struct LegacyId(pub u32);

impl LegacyId {
    pub const NONE: Self = Self(0);

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl Display for LegacyId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LegacyId {
    type Err = MigrateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value
            .trim()
            .parse::<u32>()
            .map(Self)
            .map_err(|_| MigrateError::Validation(format!("invalid legacy id: {value:?}")))
    }
}

/// Identifier assigned by the destination. `0` ([`NewId::NONE`]) means "no reference".
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(transparent)]
pub struct NewId(pub u32);

impl NewId {
    pub const NONE: Self = Self(0);

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl Display for NewId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Legacy menu/outline link id. `0` ([`LinkId::ROOT`]) marks the absence of a parent.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(transparent)]
pub struct LinkId(pub u32);

impl LinkId {
    pub const ROOT: Self = Self(0);

    #[must_use]
    pub fn is_root(self) -> bool {
        self.0 == 0
    }
}

impl Display for LinkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One persisted `(entity type, legacy id) -> new id` association.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct IdentifierMapping {
    pub entity_type: EntityTypeTag,
    pub legacy_id: LegacyId,
    pub new_id: NewId,
}
