//! Create companion command handler

use crate::cli::CreateArgs;
use crate::domain::{NewEntity, Traits, Visibility, slugify};
use crate::state::AppState;
use anyhow::Context;

pub async fn cmd_create(state: &AppState, args: &CreateArgs) -> anyhow::Result<()> {
    let name = args.name.trim();
    if name.is_empty() {
        anyhow::bail!("Companion name cannot be empty");
    }

    let new = NewEntity {
        name: name.to_string(),
        slug: Some(
            args.slug
                .as_deref()
                .map_or_else(|| slugify(name), slugify),
        ),
        traits: Traits {
            style: args.style.clone(),
            sex: args.sex.clone(),
            ethnicity: args.ethnicity.clone(),
            hair_length: args.hair_length.clone(),
            hair_color: args.hair_color.clone(),
            content_filter: args.content_filter.clone(),
        },
        visibility: if args.private {
            Visibility::Private
        } else {
            Visibility::Public
        },
        created_by: args.created_by.clone(),
        ..NewEntity::default()
    };

    let created = state
        .store
        .create(&new)
        .await
        .with_context(|| format!("Failed to create companion '{name}'"))?;

    println!("✓ Created {} ({})", created.name, created.id);
    println!("  Run 'companion-enricher run avatar' to generate its avatar.");

    Ok(())
}
