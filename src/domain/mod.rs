//! Domain types for companion records and their enrichable attributes.
//!
//! The record store, the generators and the enrichment job all speak in
//! these types; none of them knows about Airtable column names.

pub mod filter;

pub use filter::{Condition, Field};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Opaque, store-assigned identifier of a companion record.
///
/// Newtype over `String` so record ids cannot be mixed up with names or slugs.
///
/// # Examples
///
/// ```rust
/// use companion_enricher::domain::EntityId;
///
/// let id = EntityId::new("rec123");
/// assert_eq!(id.as_str(), "rec123");
/// assert_eq!(id.to_string(), "rec123");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A single independently enrichable field on a companion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    Avatar,
    Description,
    Greeting,
}

impl AttributeKind {
    pub const ALL: [Self; 3] = [Self::Avatar, Self::Description, Self::Greeting];

    /// Attribute name as used in the entity's attribute map.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Avatar => "avatar_url",
            Self::Description => "description",
            Self::Greeting => "greetings",
        }
    }

    /// Short label used on the command line and in metrics.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Avatar => "avatar",
            Self::Description => "description",
            Self::Greeting => "greeting",
        }
    }
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for AttributeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "avatar" | "avatar_url" | "avatars" => Ok(Self::Avatar),
            "description" | "descriptions" => Ok(Self::Description),
            "greeting" | "greetings" => Ok(Self::Greeting),
            other => Err(format!(
                "unknown attribute '{other}' (expected avatar, description or greeting)"
            )),
        }
    }
}

/// What a generative service is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationKind {
    Image,
    Text,
}

impl GenerationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Text => "text",
        }
    }
}

/// Generation-relevant traits stored on a companion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraitKind {
    Style,
    Sex,
    Ethnicity,
    HairLength,
    HairColor,
    ContentFilter,
}

impl TraitKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Style => "style",
            Self::Sex => "sex",
            Self::Ethnicity => "ethnicity",
            Self::HairLength => "hair_length",
            Self::HairColor => "hair_color",
            Self::ContentFilter => "content_filter",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traits {
    pub style: Option<String>,
    pub sex: Option<String>,
    pub ethnicity: Option<String>,
    pub hair_length: Option<String>,
    pub hair_color: Option<String>,
    pub content_filter: Option<String>,
}

impl Traits {
    #[must_use]
    pub fn get(&self, kind: TraitKind) -> Option<&str> {
        let value = match kind {
            TraitKind::Style => &self.style,
            TraitKind::Sex => &self.sex,
            TraitKind::Ethnicity => &self.ethnicity,
            TraitKind::HairLength => &self.hair_length,
            TraitKind::HairColor => &self.hair_color,
            TraitKind::ContentFilter => &self.content_filter,
        };
        value.as_deref().map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn set(&mut self, kind: TraitKind, value: Option<String>) {
        let slot = match kind {
            TraitKind::Style => &mut self.style,
            TraitKind::Sex => &mut self.sex,
            TraitKind::Ethnicity => &mut self.ethnicity,
            TraitKind::HairLength => &mut self.hair_length,
            TraitKind::HairColor => &mut self.hair_color,
            TraitKind::ContentFilter => &mut self.content_filter,
        };
        *slot = value;
    }

    /// Fills every missing trait from `defaults`.
    ///
    /// Returns the resolved traits together with the list of traits that were
    /// defaulted, so callers can log them instead of hiding the fallback.
    #[must_use]
    pub fn resolve(&self, defaults: &TraitDefaults) -> (ResolvedTraits, Vec<TraitKind>) {
        let mut defaulted = Vec::new();
        let mut pick = |kind: TraitKind, fallback: &str| {
            self.get(kind).map_or_else(
                || {
                    defaulted.push(kind);
                    fallback.to_string()
                },
                |v| v.to_ascii_lowercase(),
            )
        };

        let resolved = ResolvedTraits {
            style: pick(TraitKind::Style, &defaults.style),
            sex: pick(TraitKind::Sex, &defaults.sex),
            ethnicity: pick(TraitKind::Ethnicity, &defaults.ethnicity),
            hair_length: pick(TraitKind::HairLength, &defaults.hair_length),
            hair_color: pick(TraitKind::HairColor, &defaults.hair_color),
        };

        (resolved, defaulted)
    }
}

/// Explicit fallback values for traits a record does not carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraitDefaults {
    pub style: String,
    pub sex: String,
    pub ethnicity: String,
    pub hair_length: String,
    pub hair_color: String,
}

impl Default for TraitDefaults {
    fn default() -> Self {
        Self {
            style: "realistic".to_string(),
            sex: "female".to_string(),
            ethnicity: "white".to_string(),
            hair_length: "medium".to_string(),
            hair_color: "brown".to_string(),
        }
    }
}

/// Traits with every gap filled, ready to parameterize a generation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedTraits {
    pub style: String,
    pub sex: String,
    pub ethnicity: String,
    pub hair_length: String,
    pub hair_color: String,
}

impl ResolvedTraits {
    #[must_use]
    pub fn is_anime(&self) -> bool {
        self.style.contains("anime")
    }

    #[must_use]
    pub fn is_male(&self) -> bool {
        self.sex == "male"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

impl Visibility {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }

    /// Lenient parse of the store's visibility column; unknown values are public.
    #[must_use]
    pub fn parse_lenient(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("private") {
            Self::Private
        } else {
            Self::Public
        }
    }
}

/// How explicit a generation request may be.
///
/// Ordered from least to most conservative; a policy rejection steps one tier
/// towards [`SafetyTier::Conservative`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyTier {
    Mature,
    Standard,
    Conservative,
}

impl SafetyTier {
    /// Initial tier for a record, derived from its content-filter trait.
    #[must_use]
    pub fn for_content_filter(content_filter: Option<&str>) -> Self {
        match content_filter.map(str::to_ascii_lowercase).as_deref() {
            Some("uncensored" | "unfiltered" | "off") => Self::Mature,
            _ => Self::Standard,
        }
    }

    #[must_use]
    pub const fn more_conservative(self) -> Option<Self> {
        match self {
            Self::Mature => Some(Self::Standard),
            Self::Standard => Some(Self::Conservative),
            Self::Conservative => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mature => "mature",
            Self::Standard => "standard",
            Self::Conservative => "conservative",
        }
    }
}

/// A companion record as seen by the enrichment pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub slug: Option<String>,
    pub attributes: BTreeMap<AttributeKind, Option<String>>,
    pub traits: Traits,
    pub visibility: Visibility,
    pub created_by: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl Entity {
    #[must_use]
    pub fn new(id: impl Into<EntityId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            slug: None,
            attributes: BTreeMap::new(),
            traits: Traits::default(),
            visibility: Visibility::Public,
            created_by: None,
            created_at: None,
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, kind: AttributeKind, value: Option<&str>) -> Self {
        self.attributes.insert(kind, value.map(str::to_string));
        self
    }

    /// Current value of an attribute; blank strings read as absent.
    #[must_use]
    pub fn attribute(&self, kind: AttributeKind) -> Option<&str> {
        self.attributes
            .get(&kind)
            .and_then(Option::as_deref)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// Key that materialized artifacts of this record are stored under.
    ///
    /// Prefers the store's slug, then a slug of the name, then the id.
    #[must_use]
    pub fn artifact_key_base(&self) -> String {
        self.slug
            .as_deref()
            .map(slugify)
            .filter(|s| !s.is_empty())
            .or_else(|| Some(slugify(&self.name)).filter(|s| !s.is_empty()))
            .unwrap_or_else(|| slugify(self.id.as_str()))
    }

    /// Value of a logical field, as compared by [`Condition`].
    #[must_use]
    pub fn field_value(&self, field: Field) -> Option<&str> {
        match field {
            Field::Name => Some(self.name.as_str()).filter(|n| !n.trim().is_empty()),
            Field::Slug => self.slug.as_deref().filter(|s| !s.trim().is_empty()),
            Field::Attribute(kind) => self.attribute(kind),
            Field::Trait(kind) => self.traits.get(kind),
            Field::CreatedBy => self.created_by.as_deref().filter(|s| !s.trim().is_empty()),
            Field::Visibility => Some(self.visibility.as_str()),
        }
    }
}

/// Fields to write on a record; unspecified attributes are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeDelta {
    values: BTreeMap<AttributeKind, String>,
}

impl AttributeDelta {
    #[must_use]
    pub fn single(kind: AttributeKind, value: impl Into<String>) -> Self {
        let mut values = BTreeMap::new();
        values.insert(kind, value.into());
        Self { values }
    }

    pub fn iter(&self) -> impl Iterator<Item = (AttributeKind, &str)> {
        self.values.iter().map(|(k, v)| (*k, v.as_str()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Payload for inserting a new companion record.
#[derive(Debug, Clone, Default)]
pub struct NewEntity {
    pub name: String,
    pub slug: Option<String>,
    pub traits: Traits,
    pub visibility: Visibility,
    pub created_by: Option<String>,
    pub attributes: BTreeMap<AttributeKind, String>,
}

/// Lowercase, dash-separated ASCII slug.
#[must_use]
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;

    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }

    slug
}
