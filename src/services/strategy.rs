//! Per-attribute behavior plugged into the generic enrichment loop.

use crate::config::JobConfig;
use crate::domain::{
    AttributeKind, Condition, Entity, Field, GenerationKind, SafetyTier, TraitDefaults, TraitKind,
    Visibility,
};
use crate::services::generator::{Artifact, GenError, GenerationParams};
use crate::services::prompts;
use rand::Rng;
use regex::Regex;
use serde::Serialize;

/// Why an entity qualifies for enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Eligibility {
    Empty,
    NeedsRefresh { signature: String },
}

impl std::fmt::Display for Eligibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("empty"),
            Self::NeedsRefresh { signature } => write!(f, "needs refresh ({signature})"),
        }
    }
}

/// Eligibility rules and request building for one attribute.
#[derive(Debug, Clone)]
pub struct AttributeStrategy {
    kind: AttributeKind,
    refresh_signatures: Vec<Regex>,
    selection: Condition,
    defaults: TraitDefaults,
    negative_prompt: String,
}

impl AttributeStrategy {
    /// Builds the strategy for `kind` from job selection settings.
    ///
    /// # Errors
    ///
    /// Returns an error if a refresh signature is not a valid regex.
    pub fn new(
        kind: AttributeKind,
        job: &JobConfig,
        defaults: TraitDefaults,
        negative_prompt: &str,
    ) -> Result<Self, regex::Error> {
        let refresh_signatures = job
            .refresh_signatures
            .iter()
            .map(|s| Regex::new(s))
            .collect::<Result<Vec<_>, _>>()?;

        let mut terms = vec![Condition::NotBlank(Field::Name)];
        if let Some(sex) = job.only_sex.as_deref().filter(|s| !s.trim().is_empty()) {
            terms.push(Condition::Equals(Field::Trait(TraitKind::Sex), sex.to_string()));
        }
        if let Some(creator) = job.created_by.as_deref().filter(|s| !s.trim().is_empty()) {
            terms.push(Condition::Equals(Field::CreatedBy, creator.to_string()));
        }
        if job.public_only {
            terms.push(Condition::Equals(
                Field::Visibility,
                Visibility::Public.as_str().to_string(),
            ));
        }

        Ok(Self {
            kind,
            refresh_signatures,
            selection: Condition::all(terms),
            defaults,
            negative_prompt: negative_prompt.to_string(),
        })
    }

    #[must_use]
    pub const fn kind(&self) -> AttributeKind {
        self.kind
    }

    #[must_use]
    pub const fn generation_kind(&self) -> GenerationKind {
        match self.kind {
            AttributeKind::Avatar => GenerationKind::Image,
            AttributeKind::Description | AttributeKind::Greeting => GenerationKind::Text,
        }
    }

    /// Whether the generated artifact must be copied to durable storage first.
    #[must_use]
    pub const fn materializes(&self) -> bool {
        matches!(self.kind, AttributeKind::Avatar)
    }

    /// Coarse filter pushed down to the store.
    ///
    /// Populated values can still need a refresh, so the attribute itself is
    /// only constrained when no refresh signature is configured.
    #[must_use]
    pub fn store_filter(&self) -> Condition {
        if self.refresh_signatures.is_empty() {
            Condition::all([
                self.selection.clone(),
                Condition::Blank(Field::Attribute(self.kind)),
            ])
        } else {
            self.selection.clone()
        }
    }

    /// Exact eligibility check, applied to every record the store returns.
    #[must_use]
    pub fn eligibility(&self, entity: &Entity) -> Option<Eligibility> {
        if !self.selection.matches(entity) {
            return None;
        }

        match entity.attribute(self.kind) {
            None => Some(Eligibility::Empty),
            Some(value) => self
                .refresh_signatures
                .iter()
                .find(|re| re.is_match(value))
                .map(|re| Eligibility::NeedsRefresh {
                    signature: re.as_str().to_string(),
                }),
        }
    }

    /// Initial safety tier for an entity.
    #[must_use]
    pub fn initial_safety(&self, entity: &Entity) -> SafetyTier {
        SafetyTier::for_content_filter(entity.traits.get(TraitKind::ContentFilter))
    }

    /// Builds the generation request; also returns the traits that fell back
    /// to configured defaults.
    pub fn build_params<R: Rng + ?Sized>(
        &self,
        entity: &Entity,
        safety: SafetyTier,
        rng: &mut R,
    ) -> (GenerationParams, Vec<TraitKind>) {
        let (subject, defaulted) = entity.traits.resolve(&self.defaults);

        let (prompt, instructions, negative_prompt) = match self.kind {
            AttributeKind::Avatar => (
                prompts::avatar_prompt(&entity.name, &subject, safety, rng),
                None,
                Some(prompts::negative_prompt(&self.negative_prompt, safety)),
            ),
            AttributeKind::Description => {
                let (system, user) = prompts::description_prompt(&entity.name, &subject, safety);
                (user, Some(system), None)
            }
            AttributeKind::Greeting => {
                let (system, user) = prompts::greeting_prompt(&entity.name, &subject, safety);
                (user, Some(system), None)
            }
        };

        let params = GenerationParams {
            subject_name: entity.name.clone(),
            subject,
            prompt,
            instructions,
            negative_prompt,
            safety,
        };
        (params, defaulted)
    }

    /// Turns a generator artifact into the value handed to the next step.
    ///
    /// # Errors
    ///
    /// Returns [`GenError::Upstream`] if the artifact has the wrong shape for
    /// this attribute or carries no usable content.
    pub fn accept(&self, artifact: Artifact) -> Result<String, GenError> {
        match (self.kind, artifact) {
            (AttributeKind::Avatar, Artifact::RemoteUrl(url)) => Ok(url),
            (AttributeKind::Description, Artifact::Text(text)) => {
                let text = text.trim();
                if text.is_empty() {
                    Err(GenError::Upstream("empty description".to_string()))
                } else {
                    Ok(text.to_string())
                }
            }
            (AttributeKind::Greeting, Artifact::Text(text)) => prompts::join_greetings(&text)
                .ok_or_else(|| GenError::Upstream("no greetings in completion".to_string())),
            (kind, other) => Err(GenError::Upstream(format!(
                "unexpected artifact for {kind}: {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn strategy(kind: AttributeKind, job: &JobConfig) -> AttributeStrategy {
        AttributeStrategy::new(kind, job, TraitDefaults::default(), "blurry").unwrap()
    }

    #[test]
    fn test_eligibility_empty_and_refresh() {
        let s = strategy(AttributeKind::Avatar, &JobConfig::default());

        let empty = Entity::new("rec1", "A");
        assert_eq!(s.eligibility(&empty), Some(Eligibility::Empty));

        let stale = Entity::new("rec2", "B").with_attribute(
            AttributeKind::Avatar,
            Some("https://replicate.delivery/xyz/out-0.webp"),
        );
        assert!(matches!(
            s.eligibility(&stale),
            Some(Eligibility::NeedsRefresh { .. })
        ));

        let good = Entity::new("rec3", "C")
            .with_attribute(AttributeKind::Avatar, Some("https://cdn.example/c.webp"));
        assert_eq!(s.eligibility(&good), None);

        let nameless = Entity::new("rec4", " ");
        assert_eq!(s.eligibility(&nameless), None);
    }

    #[test]
    fn test_selection_filters() {
        let job = JobConfig {
            only_sex: Some("female".to_string()),
            public_only: true,
            ..JobConfig::default()
        };
        let s = strategy(AttributeKind::Description, &job);

        let mut female = Entity::new("rec1", "A");
        female.traits.sex = Some("Female".to_string());
        assert_eq!(s.eligibility(&female), Some(Eligibility::Empty));

        let mut private = female.clone();
        private.visibility = Visibility::Private;
        assert_eq!(s.eligibility(&private), None);

        let mut male = female;
        male.traits.sex = Some("male".to_string());
        assert_eq!(s.eligibility(&male), None);
    }

    #[test]
    fn test_store_filter_pushes_blank_without_signatures() {
        let job = JobConfig {
            refresh_signatures: Vec::new(),
            ..JobConfig::default()
        };
        let s = strategy(AttributeKind::Greeting, &job);
        assert_eq!(
            s.store_filter(),
            Condition::All(vec![
                Condition::NotBlank(Field::Name),
                Condition::Blank(Field::Attribute(AttributeKind::Greeting)),
            ])
        );

        let s = strategy(AttributeKind::Avatar, &JobConfig::default());
        assert_eq!(s.store_filter(), Condition::NotBlank(Field::Name));
    }

    #[test]
    fn test_build_params_reports_defaults() {
        let s = strategy(AttributeKind::Avatar, &JobConfig::default());
        let mut entity = Entity::new("rec1", "Aria");
        entity.traits.sex = Some("female".to_string());

        let mut rng = StdRng::seed_from_u64(1);
        let (params, defaulted) = s.build_params(&entity, SafetyTier::Standard, &mut rng);

        assert_eq!(params.subject_name, "Aria");
        assert_eq!(params.subject.hair_color, "brown");
        assert!(params.instructions.is_none());
        assert!(params.negative_prompt.is_some());
        assert!(defaulted.contains(&TraitKind::HairColor));
        assert!(!defaulted.contains(&TraitKind::Sex));
    }

    #[test]
    fn test_accept_checks_artifact_shape() {
        let avatar = strategy(AttributeKind::Avatar, &JobConfig::default());
        assert!(avatar.accept(Artifact::Text("x".to_string())).is_err());

        let greeting = strategy(AttributeKind::Greeting, &JobConfig::default());
        assert_eq!(
            greeting
                .accept(Artifact::Text("Hi!\nHello!".to_string()))
                .unwrap(),
            "Hi!|||Hello!"
        );
    }
}
