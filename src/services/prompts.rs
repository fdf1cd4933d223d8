//! Prompt rendering for avatar, description and greeting generation.

use crate::domain::{ResolvedTraits, SafetyTier};
use rand::Rng;
use rand::seq::IndexedRandom;

/// Separator between individual greetings in the stored greetings field.
pub const GREETING_SEPARATOR: &str = "|||";

pub const GREETING_COUNT: usize = 4;

fn ethnicity_features(ethnicity: &str) -> &'static str {
    match ethnicity {
        "white" | "caucasian" => "Caucasian/European features",
        "black" | "african" => "African/Black features",
        "indian" => "South Asian/Indian features",
        "middle-east" | "middle eastern" | "arab" => "Middle Eastern features",
        "hispanic" | "latina" | "latino" => "Hispanic/Latino features",
        "korean" => "Korean features",
        "chinese" => "Chinese features",
        "japanese" => "Japanese features",
        "vietnamese" => "Vietnamese features",
        _ => "diverse features",
    }
}

fn hair_length_phrase(length: &str) -> &'static str {
    match length {
        "short" => "short hair",
        "medium" => "medium length hair, shoulder-length hair",
        "long" => "long hair, flowing hair",
        _ => "styled hair",
    }
}

fn hair_color_phrase(color: &str) -> String {
    match color {
        "blonde" | "blond" => "blonde hair, golden hair".to_string(),
        "red" | "ginger" => "red hair, ginger hair".to_string(),
        "auburn" => "auburn hair, reddish-brown hair".to_string(),
        "gray" | "grey" => "gray hair, silver hair".to_string(),
        "white" | "platinum" => "white hair, platinum hair".to_string(),
        "" => "brown hair".to_string(),
        other => format!("{other} hair"),
    }
}

fn outfits(male: bool, safety: SafetyTier) -> &'static [&'static str] {
    match (male, safety) {
        (false, SafetyTier::Mature) => &[
            "fitted cocktail dress",
            "elegant evening gown",
            "silk slip dress",
            "stylish crop top and skirt",
        ],
        (false, SafetyTier::Standard) => &[
            "casual chic outfit",
            "elegant blouse and skirt",
            "summer dress",
            "stylish jacket and jeans",
        ],
        (false, SafetyTier::Conservative) => &[
            "cozy knit sweater",
            "business casual attire",
            "long-sleeve dress",
        ],
        (true, SafetyTier::Mature) => &[
            "open-collar shirt",
            "fitted tank top",
            "tailored suit without tie",
        ],
        (true, SafetyTier::Standard) => &[
            "casual button-up shirt",
            "leather jacket and t-shirt",
            "smart casual outfit",
        ],
        (true, SafetyTier::Conservative) => &[
            "crew-neck sweater",
            "business suit",
            "casual hoodie",
        ],
    }
}

/// Physical description shared by every prompt for this subject.
#[must_use]
pub fn appearance(traits: &ResolvedTraits) -> String {
    let build = if traits.is_male() {
        "handsome man, masculine features"
    } else {
        "beautiful woman, feminine features"
    };

    format!(
        "{build}, {}, {}, {}",
        ethnicity_features(&traits.ethnicity),
        hair_length_phrase(&traits.hair_length),
        hair_color_phrase(&traits.hair_color)
    )
}

/// Image prompt for a portrait avatar at the given safety tier.
pub fn avatar_prompt<R: Rng + ?Sized>(
    name: &str,
    traits: &ResolvedTraits,
    safety: SafetyTier,
    rng: &mut R,
) -> String {
    let outfit = outfits(traits.is_male(), safety)
        .choose(rng)
        .copied()
        .unwrap_or("casual outfit");
    let look = appearance(traits);

    let (mood, finish) = match safety {
        SafetyTier::Mature => (
            "alluring expression, confident pose",
            "glamour lighting, elegant setting",
        ),
        SafetyTier::Standard => ("warm smile, relaxed pose", "soft natural lighting"),
        SafetyTier::Conservative => (
            "friendly expression, head and shoulders portrait",
            "neutral background, fully clothed, safe for work",
        ),
    };

    let style = if traits.is_anime() {
        "anime style, detailed anime art, vibrant colors, high quality anime artwork"
    } else {
        "photorealistic, professional photography, sharp focus"
    };

    format!(
        "portrait of {name}, {look}, {mood}, wearing {outfit}, {finish}, {style}, single person, solo"
    )
}

/// Negative prompt, tightened for the conservative tier.
#[must_use]
pub fn negative_prompt(base: &str, safety: SafetyTier) -> String {
    match safety {
        SafetyTier::Conservative if base.is_empty() => {
            "nsfw, nudity, revealing clothing, suggestive".to_string()
        }
        SafetyTier::Conservative => format!("{base}, nsfw, nudity, revealing clothing, suggestive"),
        _ => base.to_string(),
    }
}

fn tone(safety: SafetyTier) -> &'static str {
    match safety {
        SafetyTier::Mature => "flirty and engaging, with subtle sensuality",
        SafetyTier::Standard => "friendly and engaging",
        SafetyTier::Conservative => "warm and wholesome, strictly non-sexual",
    }
}

fn profile(name: &str, traits: &ResolvedTraits) -> String {
    format!(
        "Name: {name}\nGender: {}\nEthnicity: {}\nHair: {}, {}\nStyle: {}",
        traits.sex, traits.ethnicity, traits.hair_length, traits.hair_color, traits.style
    )
}

/// System and user messages for a short third-person character description.
#[must_use]
pub fn description_prompt(
    name: &str,
    traits: &ResolvedTraits,
    safety: SafetyTier,
) -> (String, String) {
    let system = format!(
        "You are a creative writer specializing in character creation.\n\
         Write a character description:\n\
         - 25-50 words (2-3 sentences)\n\
         - Focus on who they are, their personality and what makes them unique\n\
         - Include one subtle hint about desires, fears or secrets\n\
         - Third person narrative style\n\
         - Tone: {}\n\
         - Return only the description, no greetings, headings or quotes",
        tone(safety)
    );
    let user = format!(
        "Write a description for this companion:\n\n{}",
        profile(name, traits)
    );
    (system, user)
}

/// System and user messages for a set of first-person greetings.
#[must_use]
pub fn greeting_prompt(
    name: &str,
    traits: &ResolvedTraits,
    safety: SafetyTier,
) -> (String, String) {
    let system = format!(
        "You are a creative writer specializing in character dialogue.\n\
         Write {GREETING_COUNT} different greetings the character says when meeting someone:\n\
         - One greeting per line, no numbering and no quotes\n\
         - 1-2 sentences each, conversational and in character, first person\n\
         - Put actions in asterisks after the dialogue, e.g. \"Hey there, I'm {name} *smiles*\"\n\
         - Vary the mood between greetings\n\
         - Tone: {}",
        tone(safety)
    );
    let user = format!(
        "Write {GREETING_COUNT} greetings for this companion:\n\n{}",
        profile(name, traits)
    );
    (system, user)
}

/// Normalizes raw greeting output into the stored `|||`-separated form.
///
/// Returns `None` when no usable greeting line is present.
#[must_use]
pub fn join_greetings(raw: &str) -> Option<String> {
    let greetings: Vec<&str> = raw
        .lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| c.is_ascii_digit() || matches!(c, '.' | ')' | '-'))
                .trim()
                .trim_matches('"')
                .trim()
        })
        .filter(|line| !line.is_empty())
        .take(GREETING_COUNT)
        .collect();

    (!greetings.is_empty()).then(|| greetings.join(GREETING_SEPARATOR))
}
