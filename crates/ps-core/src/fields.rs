//! Well-known column names and the per-API field mapping

use serde::{Deserialize, Serialize};

pub const RGT: &str = "rgt";
pub const CYCLE: &str = "cycle";
pub const TRACK: &str = "track";
pub const GT: &str = "gt";
pub const SPOT: &str = "spot";
pub const PAIR: &str = "pair";
pub const SC_ORIENT: &str = "sc_orient";
pub const SRCID: &str = "srcid";
pub const ATL03_CNF: &str = "atl03_cnf";
pub const ATL08_CLASS: &str = "atl08_class";
pub const ATL24_CLASS: &str = "atl24_class";

/// Height/latitude/longitude column names for one API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldNames {
    pub height: String,
    pub lat: String,
    pub lon: String,
    /// Time column, when the API produces one
    pub time: Option<String>,
}

impl Default for FieldNames {
    fn default() -> Self {
        Self {
            height: "height".to_string(),
            lat: "latitude".to_string(),
            lon: "longitude".to_string(),
            time: Some("time_ns".to_string()),
        }
    }
}

impl FieldNames {
    fn with_height(height: &str) -> Self {
        Self {
            height: height.to_string(),
            ..Default::default()
        }
    }

    /// Field mapping for a known API name; unknown APIs use the defaults
    pub fn for_api(api: &str) -> Self {
        match api {
            "atl06" | "atl06p" | "atl06s" | "atl06sp" | "atl06x" => Self::with_height("h_mean"),
            "atl03x" | "atl03s" | "atl03sp" | "atl03vp" => Self::with_height("height"),
            "atl08" | "atl08p" | "atl03x-phoreal" => Self::with_height("h_mean_canopy"),
            "atl24x" => Self::with_height("ortho_h"),
            "atl13x" => Self::with_height("ht_ortho"),
            "gedi04a" | "gedi04ap" => Self::with_height("elevation"),
            "gedi01b" | "gedi01bp" => Self::with_height("elevation_start"),
            "gedi02a" | "gedi02ap" => Self::with_height("elevation_lm"),
            _ => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_api() {
        assert_eq!(FieldNames::for_api("atl06").height, "h_mean");
        assert_eq!(FieldNames::for_api("atl03x").height, "height");
        assert_eq!(FieldNames::for_api("atl08p").height, "h_mean_canopy");
        assert_eq!(FieldNames::for_api("atl24x").height, "ortho_h");
        assert_eq!(FieldNames::for_api("atl13x").height, "ht_ortho");
        assert_eq!(FieldNames::for_api("gedi02a").height, "elevation_lm");
        assert_eq!(FieldNames::for_api("unknown"), FieldNames::default());
    }
}
