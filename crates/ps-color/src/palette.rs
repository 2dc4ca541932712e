//! Named gradient palettes, generated procedurally

use colorous::Gradient;

/// Color returned for values a map does not cover
pub const FALLBACK_COLOR: &str = "white";

/// Fewest shades a gradient palette is generated with
pub const MIN_SHADES: usize = 10;

const GRADIENTS: &[(&str, Gradient)] = &[
    ("viridis", colorous::VIRIDIS),
    ("plasma", colorous::PLASMA),
    ("inferno", colorous::INFERNO),
    ("magma", colorous::MAGMA),
    ("cividis", colorous::CIVIDIS),
    ("turbo", colorous::TURBO),
    ("warm", colorous::WARM),
    ("cool", colorous::COOL),
    ("cubehelix", colorous::CUBEHELIX),
    ("rainbow", colorous::RAINBOW),
    ("sinebow", colorous::SINEBOW),
    ("greys", colorous::GREYS),
    ("blues", colorous::BLUES),
    ("greens", colorous::GREENS),
    ("reds", colorous::REDS),
    ("spectral", colorous::SPECTRAL),
];

/// Names accepted by [`generate`]
pub fn palette_names() -> Vec<&'static str> {
    GRADIENTS.iter().map(|(name, _)| *name).collect()
}

pub fn is_known(name: &str) -> bool {
    lookup(name).is_some()
}

fn lookup(name: &str) -> Option<Gradient> {
    let name = name.to_ascii_lowercase();
    GRADIENTS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, gradient)| *gradient)
}

/// `rgba(r, g, b, 1)` string for a palette entry
pub fn css_rgba(color: colorous::Color) -> String {
    format!("rgba({}, {}, {}, 1)", color.r, color.g, color.b)
}

/// Sample `shades` evenly spaced colors from the named palette.
/// Returns `None` for unknown names. At least [`MIN_SHADES`] are generated.
pub fn generate(name: &str, shades: usize) -> Option<Vec<String>> {
    let gradient = lookup(name)?;
    let shades = shades.max(MIN_SHADES);
    let last = (shades - 1) as f64;
    Some(
        (0..shades)
            .map(|i| css_rgba(gradient.eval_continuous(i as f64 / last)))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_endpoints() {
        let colors = generate("viridis", 256).unwrap();
        assert_eq!(colors.len(), 256);
        assert_eq!(colors[0], css_rgba(colorous::VIRIDIS.eval_continuous(0.0)));
        assert_eq!(colors[255], css_rgba(colorous::VIRIDIS.eval_continuous(1.0)));
        assert!(colors[0].starts_with("rgba("));
        assert!(colors[0].ends_with(", 1)"));
    }

    #[test]
    fn test_minimum_shades() {
        assert_eq!(generate("plasma", 2).unwrap().len(), MIN_SHADES);
    }

    #[test]
    fn test_names_are_case_insensitive() {
        assert!(is_known("Plasma"));
        assert!(!is_known("no-such-palette"));
        assert!(generate("nope", 64).is_none());
        assert!(palette_names().contains(&"turbo"));
    }
}
