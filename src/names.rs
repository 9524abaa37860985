//! Themed session-name allocation.
//!
//! The runner derives session names from epic IDs; this pool is the fallback
//! when the derived name is already taken by a live session.

use rand::seq::IndexedRandom;

const THEMES: &[(&str, &[&str])] = &[
    (
        "rivers",
        &[
            "amur", "congo", "danube", "ganges", "indus", "lena", "mekong", "niger", "oder",
            "plata", "rhine", "volga", "yukon",
        ],
    ),
    (
        "gems",
        &[
            "agate", "beryl", "citrine", "garnet", "jasper", "lazuli", "onyx", "opal", "peridot",
            "spinel", "topaz", "zircon",
        ],
    ),
    (
        "winds",
        &[
            "bora", "chinook", "foehn", "gale", "harmattan", "khamsin", "levant", "mistral",
            "monsoon", "sirocco", "zephyr",
        ],
    ),
];

/// Allocate a short identifier not present in `in_use`.
///
/// Walks a random theme first, then every theme, then falls back to a
/// numbered variant, so allocation always succeeds.
pub fn allocate(in_use: &[String]) -> String {
    let mut rng = rand::rng();

    if let Some((_, names)) = THEMES.choose(&mut rng) {
        if let Some(name) = pick_free(names, in_use, &mut rng) {
            return name;
        }
    }

    for (_, names) in THEMES {
        if let Some(name) = pick_free(names, in_use, &mut rng) {
            return name;
        }
    }

    // Every themed name is taken; suffix until free.
    let mut n = 2;
    loop {
        let candidate = format!("zephyr-{n}");
        if !in_use.iter().any(|u| u == &candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn pick_free(
    names: &[&str],
    in_use: &[String],
    rng: &mut impl rand::Rng,
) -> Option<String> {
    let free: Vec<&&str> = names
        .iter()
        .filter(|n| !in_use.iter().any(|u| u == **n))
        .collect();
    free.choose(rng).map(|n| (**n).to_string())
}
