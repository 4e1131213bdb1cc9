#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Preset {
    pub id: &'static str,
    pub label: &'static str,
    pub prompt: &'static str,
}

pub const PRESETS: &[Preset] = &[
    Preset {
        id: "nobg",
        label: "Remove Background",
        prompt: "Completely remove the background and make it transparent or pure white.",
    },
    Preset {
        id: "shadow",
        label: "Add Soft Shadow",
        prompt: "Add a realistic soft drop shadow beneath the product to ground it.",
    },
    Preset {
        id: "brighten",
        label: "Pro Lighting",
        prompt: "Apply professional studio lighting to the product, making it bright and clear.",
    },
    Preset {
        id: "clean",
        label: "Clean Distractions",
        prompt: "Remove any dust, scratches, or background distractions from the product shot.",
    },
    Preset {
        id: "retro",
        label: "Retro Aesthetic",
        prompt: "Apply a warm, nostalgic retro filter with slight grain and vintage colors.",
    },
    Preset {
        id: "nature",
        label: "Outdoor Setting",
        prompt: "Place the product in a natural outdoor setting with soft sunlight.",
    },
];

pub fn find_preset(id: &str) -> Option<&'static Preset> {
    let needle = id.trim();
    PRESETS
        .iter()
        .find(|preset| preset.id.eq_ignore_ascii_case(needle))
}
