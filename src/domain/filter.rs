//! Store-side filter expressions over logical companion fields.
//!
//! A [`Condition`] is evaluated locally by in-memory stores and rendered into
//! a query language by remote ones, so both sides agree on what matches.

use super::{AttributeKind, Entity, TraitKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Name,
    Slug,
    Attribute(AttributeKind),
    Trait(TraitKind),
    CreatedBy,
    Visibility,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Always,
    Blank(Field),
    NotBlank(Field),
    /// Case-insensitive equality on the trimmed field value.
    Equals(Field, String),
    All(Vec<Condition>),
    Any(Vec<Condition>),
}

impl Condition {
    /// Conjunction that drops `Always` terms and collapses trivial cases.
    #[must_use]
    pub fn all(conditions: impl IntoIterator<Item = Self>) -> Self {
        let mut terms: Vec<Self> = conditions
            .into_iter()
            .filter(|c| !matches!(c, Self::Always))
            .collect();

        match terms.len() {
            0 => Self::Always,
            1 => terms.remove(0),
            _ => Self::All(terms),
        }
    }

    #[must_use]
    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            Self::Always => true,
            Self::Blank(field) => entity.field_value(*field).is_none(),
            Self::NotBlank(field) => entity.field_value(*field).is_some(),
            Self::Equals(field, expected) => entity
                .field_value(*field)
                .is_some_and(|v| v.eq_ignore_ascii_case(expected.trim())),
            Self::All(terms) => terms.iter().all(|c| c.matches(entity)),
            Self::Any(terms) => terms.iter().any(|c| c.matches(entity)),
        }
    }
}
