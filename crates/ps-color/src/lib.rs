//! Color mapping for pointscope datasets
//!
//! Two kinds of maps turn column values into CSS color strings: gradient
//! maps bucket continuous values over a `[min, max]` range, classification
//! maps look small integer codes up in a user-overridable table. Each open
//! dataset gets its own [`ColorCache`] per color-mapped column, held in a
//! [`ColorCacheArena`].

pub mod arena;
pub mod cache;
pub mod classification;
pub mod gradient;
pub mod palette;

use thiserror::Error;

pub use arena::ColorCacheArena;
pub use cache::{ColorCache, ColorSource};
pub use classification::{ClassificationFamily, ClassificationTable};
pub use gradient::{GradientMap, GradientPreference};
pub use palette::FALLBACK_COLOR;

/// Errors raised while editing or persisting color maps.
///
/// Lookups never fail; they resolve to [`FALLBACK_COLOR`] instead.
#[derive(Error, Debug)]
pub enum ColorError {
    #[error("Code {code} is not defined for {family}")]
    UnknownCode { family: String, code: i64 },

    #[error("Unknown classification family: {0}")]
    UnknownFamily(String),

    #[error("Unknown palette: {0}")]
    UnknownPalette(String),

    #[error("Column {0} is not in the data order")]
    UnknownColumn(String),

    #[error("Preference storage failed: {0}")]
    Preferences(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
}

pub type Result<T, E = ColorError> = std::result::Result<T, E>;

pub(crate) fn prefs_error(error: impl std::fmt::Display) -> ColorError {
    ColorError::Preferences(error.to_string())
}
