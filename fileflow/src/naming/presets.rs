//! Built-in patterns users can pick by name.

/// A named pattern shipped with the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternPreset {
    pub name: &'static str,
    pub template: &'static str,
    pub description: &'static str,
}

const fn preset(
    name: &'static str,
    template: &'static str,
    description: &'static str,
) -> PatternPreset {
    PatternPreset {
        name,
        template,
        description,
    }
}

pub const PRESETS: &[PatternPreset] = &[
    preset(
        "movie_collection",
        "Movie_{counter:02}_{original}",
        "Numbered movie files",
    ),
    preset("date_based", "{date}_{time}_{original}", "Date and time prefix"),
    preset("user_files", "{user}_{counter}_{original}", "Owner and number prefix"),
    preset(
        "numbered_sequence",
        "{original}_{counter:03}",
        "Original name with a zero-padded number",
    ),
    preset("timestamped", "{timestamp}_{original}", "Unix timestamp prefix"),
    preset("categorized", "{type}_{date}_{original}", "Media kind and date prefix"),
    preset(
        "professional",
        "{year}{month}{day}_{counter:04}_{original}",
        "Compact date with a four-digit number",
    ),
];

/// Look a preset up by name, ignoring case.
pub fn find_preset(name: &str) -> Option<&'static PatternPreset> {
    let name = name.trim();
    PRESETS.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::validate_pattern;

    #[test]
    fn test_presets_are_valid_and_unique() {
        let mut names = std::collections::HashSet::new();
        for preset in PRESETS {
            validate_pattern(preset.template).unwrap();
            assert!(names.insert(preset.name), "duplicate preset {}", preset.name);
        }
    }

    #[test]
    fn test_find_preset() {
        assert_eq!(
            find_preset(" Date_Based ").map(|p| p.template),
            Some("{date}_{time}_{original}")
        );
        assert!(find_preset("tv_series").is_none());
    }
}
