//! Small-integer category codes to color lookup tables

use ps_core::fields::{ATL03_CNF, ATL08_CLASS, ATL24_CLASS};
use ps_core::prefs::classification_key;
use ps_core::PreferenceStore;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::palette::FALLBACK_COLOR;
use crate::{prefs_error, ColorError, Result};

/// Column families colored by category code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationFamily {
    /// Photon signal confidence
    Atl03Cnf,
    /// Land/vegetation photon class
    Atl08Class,
    /// Bathymetry photon class
    Atl24Class,
}

impl ClassificationFamily {
    pub const ALL: [ClassificationFamily; 3] = [
        ClassificationFamily::Atl03Cnf,
        ClassificationFamily::Atl08Class,
        ClassificationFamily::Atl24Class,
    ];

    /// Column the family colors, also its preference name
    pub fn column(&self) -> &'static str {
        match self {
            ClassificationFamily::Atl03Cnf => ATL03_CNF,
            ClassificationFamily::Atl08Class => ATL08_CLASS,
            ClassificationFamily::Atl24Class => ATL24_CLASS,
        }
    }

    pub fn from_column(column: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.column() == column)
    }

    /// Defined codes with their labels and default colors
    pub fn definitions(&self) -> &'static [(i64, &'static str, &'static str)] {
        match self {
            ClassificationFamily::Atl03Cnf => &[
                (-2, "atl03_tep", "white"),
                (-1, "atl03_not_considered", "slategray"),
                (0, "atl03_background", "blue"),
                (1, "atl03_within_10m", "blue"),
                (2, "atl03_low", "green"),
                (3, "atl03_medium", "yellow"),
                (4, "atl03_high", "violet"),
            ],
            ClassificationFamily::Atl08Class => &[
                (0, "atl08_noise", "blue"),
                (1, "atl08_ground", "violet"),
                (2, "atl08_canopy", "lightgreen"),
                (3, "atl08_top_of_canopy", "green"),
                (4, "atl08_unclassified", "slategray"),
            ],
            ClassificationFamily::Atl24Class => &[
                (0, "atl24_unclassified", "purple"),
                (40, "atl24_bathymetry", "greenyellow"),
                (41, "atl24_sea_surface", "lightblue"),
            ],
        }
    }

    pub fn codes(&self) -> Vec<i64> {
        self.definitions().iter().map(|(code, _, _)| *code).collect()
    }

    pub fn label(&self, code: i64) -> Option<&'static str> {
        self.slot(code).map(|i| self.definitions()[i].1)
    }

    fn slot(&self, code: i64) -> Option<usize> {
        self.definitions().iter().position(|(c, _, _)| *c == code)
    }

    fn default_colors(&self) -> Vec<String> {
        self.definitions()
            .iter()
            .map(|(_, _, color)| color.to_string())
            .collect()
    }
}

/// Current colors for one family, in definition order
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationTable {
    family: ClassificationFamily,
    colors: Vec<String>,
    version: u64,
}

impl ClassificationTable {
    pub fn with_defaults(family: ClassificationFamily) -> Self {
        Self {
            family,
            colors: family.default_colors(),
            version: 0,
        }
    }

    /// Defaults overlaid with any overrides stored for the family.
    /// A stored table of the wrong length is ignored.
    pub fn load(family: ClassificationFamily, store: &dyn PreferenceStore) -> Result<Self> {
        let mut table = Self::with_defaults(family);
        let key = classification_key(family.column());
        if let Some(raw) = store.load(&key).map_err(prefs_error)? {
            let stored: Vec<String> = serde_json::from_str(&raw)?;
            if stored.len() == table.colors.len() {
                table.colors = stored;
            }
        }
        Ok(table)
    }

    pub fn save(&self, store: &dyn PreferenceStore) -> Result<()> {
        let raw = serde_json::to_string(&self.colors)?;
        store
            .save(&classification_key(self.family.column()), &raw)
            .map_err(prefs_error)
    }

    pub fn family(&self) -> ClassificationFamily {
        self.family
    }

    /// Bumped on every mutation
    pub fn version(&self) -> u64 {
        self.version
    }

    /// `None` for codes outside the family
    pub fn color(&self, code: i64) -> Option<&str> {
        self.family.slot(code).map(|i| self.colors[i].as_str())
    }

    pub fn color_or_fallback(&self, code: i64) -> &str {
        self.color(code).unwrap_or(FALLBACK_COLOR)
    }

    /// `(code, label, color)` for every defined code
    pub fn entries(&self) -> Vec<(i64, &'static str, &str)> {
        self.family
            .definitions()
            .iter()
            .zip(&self.colors)
            .map(|((code, label, _), color)| (*code, *label, color.as_str()))
            .collect()
    }

    pub fn set_color(&mut self, code: i64, color: impl Into<String>) -> Result<()> {
        let slot = self.family.slot(code).ok_or_else(|| ColorError::UnknownCode {
            family: self.family.column().to_string(),
            code,
        })?;
        self.colors[slot] = color.into();
        self.version += 1;
        Ok(())
    }

    pub fn restore_defaults(&mut self) {
        self.colors = self.family.default_colors();
        self.version += 1;
        info!("{} colors restored to defaults", self.family.column());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ps_core::InMemoryPreferences;

    #[test]
    fn test_defaults_cover_every_code() {
        for family in ClassificationFamily::ALL {
            let table = ClassificationTable::with_defaults(family);
            for code in family.codes() {
                assert!(table.color(code).is_some());
            }
        }
        let atl24 = ClassificationTable::with_defaults(ClassificationFamily::Atl24Class);
        assert_eq!(atl24.color(40), Some("greenyellow"));
        assert_eq!(atl24.color(1), None);
        assert_eq!(atl24.color_or_fallback(1), FALLBACK_COLOR);
    }

    #[test]
    fn test_out_of_range_codes() {
        let table = ClassificationTable::with_defaults(ClassificationFamily::Atl03Cnf);
        assert_eq!(table.color(-2), Some("white"));
        assert_eq!(table.color(-3), None);
        assert_eq!(table.color(5), None);
    }

    #[test]
    fn test_set_color_and_restore() {
        let mut table = ClassificationTable::with_defaults(ClassificationFamily::Atl08Class);
        table.set_color(1, "red").unwrap();
        assert_eq!(table.color(1), Some("red"));
        assert_eq!(table.version(), 1);
        assert!(matches!(
            table.set_color(9, "red"),
            Err(ColorError::UnknownCode { code: 9, .. })
        ));
        table.restore_defaults();
        assert_eq!(table.color(1), Some("violet"));
        assert_eq!(table.version(), 2);
    }

    #[test]
    fn test_overrides_persist() {
        let store = InMemoryPreferences::new();
        let mut table = ClassificationTable::load(ClassificationFamily::Atl03Cnf, &store).unwrap();
        table.set_color(4, "orange").unwrap();
        table.save(&store).unwrap();

        let reloaded = ClassificationTable::load(ClassificationFamily::Atl03Cnf, &store).unwrap();
        assert_eq!(reloaded.color(4), Some("orange"));
        assert_eq!(reloaded.color(3), Some("yellow"));

        // other families are untouched
        let other = ClassificationTable::load(ClassificationFamily::Atl08Class, &store).unwrap();
        assert_eq!(other, ClassificationTable::with_defaults(ClassificationFamily::Atl08Class));
    }

    #[test]
    fn test_family_lookup() {
        assert_eq!(
            ClassificationFamily::from_column("atl24_class"),
            Some(ClassificationFamily::Atl24Class)
        );
        assert_eq!(ClassificationFamily::from_column("height"), None);
        assert_eq!(ClassificationFamily::Atl03Cnf.label(1), Some("atl03_within_10m"));
    }
}
