use serde::{Deserialize, Serialize};
use std::fmt;

/// Vial tray models the autosampler accepts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TrayKind {
    #[serde(rename = "VT15")]
    Vt15,
    #[serde(rename = "VT54")]
    Vt54,
    #[serde(rename = "VT70")]
    Vt70,
}

impl TrayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vt15 => "VT15",
            Self::Vt54 => "VT54",
            Self::Vt70 => "VT70",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "VT15" => Some(Self::Vt15),
            "VT54" => Some(Self::Vt54),
            "VT70" => Some(Self::Vt70),
            _ => None,
        }
    }

    pub fn vial_count(&self) -> u32 {
        match self {
            Self::Vt15 => 15,
            Self::Vt54 => 54,
            Self::Vt70 => 70,
        }
    }

    pub fn max_volume_ml(&self) -> f64 {
        match self {
            Self::Vt15 => 10.0,
            Self::Vt54 => 2.0,
            Self::Vt70 => 1.0,
        }
    }
}

/// Tray coordinate; vial indices start at 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrayCoord {
    pub tray: u32,
    pub slot: u32,
    pub vial: u32,
}

impl TrayCoord {
    pub fn new(tray: u32, slot: u32, vial: u32) -> Self {
        Self { tray, slot, vial }
    }
}

impl fmt::Display for TrayCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tray {}/slot {}/vial {}", self.tray, self.slot, self.vial)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomCapabilities {
    #[serde(default)]
    pub assembly_allowed: bool,
    #[serde(default = "default_true")]
    pub destination_allowed: bool,
    #[serde(default)]
    pub always_destroys: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CustomCapabilities {
    fn default() -> Self {
        Self {
            assembly_allowed: false,
            destination_allowed: true,
            always_destroys: false,
        }
    }
}

impl CustomCapabilities {
    pub fn with_assembly(mut self, allowed: bool) -> Self {
        self.assembly_allowed = allowed;
        self
    }

    pub fn with_destination(mut self, allowed: bool) -> Self {
        self.destination_allowed = allowed;
        self
    }

    pub fn with_always_destroys(mut self, destroys: bool) -> Self {
        self.always_destroys = destroys;
        self
    }
}

/// A named, fixed sample location such as a cell reservoir or an injector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomPosition {
    pub name: String,
    #[serde(default)]
    pub capabilities: CustomCapabilities,
}

impl CustomPosition {
    pub fn new(name: impl Into<String>, capabilities: CustomCapabilities) -> Self {
        Self {
            name: name.into(),
            capabilities,
        }
    }
}

/// Name the instrument command uses for tray positions.
pub const TRAY_POSITION_NAME: &str = "tray";

/// A concrete position after resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Position {
    Custom(CustomPosition),
    Tray { coord: TrayCoord, tray_kind: TrayKind },
}

impl Position {
    pub fn key(&self) -> PositionKey {
        match self {
            Self::Custom(c) => PositionKey::Custom(c.name.clone()),
            Self::Tray { coord, .. } => PositionKey::Tray(*coord),
        }
    }

    /// The position name as written into instrument parameters.
    pub fn name(&self) -> &str {
        match self {
            Self::Custom(c) => &c.name,
            Self::Tray { .. } => TRAY_POSITION_NAME,
        }
    }

    pub fn coord(&self) -> Option<TrayCoord> {
        match self {
            Self::Custom(_) => None,
            Self::Tray { coord, .. } => Some(*coord),
        }
    }

    pub fn capabilities(&self) -> CustomCapabilities {
        match self {
            Self::Custom(c) => c.capabilities,
            Self::Tray { .. } => CustomCapabilities::default(),
        }
    }

    pub fn capacity_ml(&self) -> Option<f64> {
        match self {
            Self::Custom(_) => None,
            Self::Tray { tray_kind, .. } => Some(tray_kind.max_volume_ml()),
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom(c) => write!(f, "custom '{}'", c.name),
            Self::Tray { coord, tray_kind } => write!(f, "{} ({})", coord, tray_kind.as_str()),
        }
    }
}

/// Identity of a position independent of its capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PositionKey {
    Custom(String),
    Tray(TrayCoord),
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom(name) => write!(f, "custom '{}'", name),
            Self::Tray(coord) => write!(f, "{}", coord),
        }
    }
}

/// Position as requested by a MicroStep, before resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PositionRequest {
    Custom { name: String },
    Tray(TrayCoord),
    NextEmptyVial,
    NextFullVialAfter(TrayCoord),
}

impl PositionRequest {
    pub fn custom(name: impl Into<String>) -> Self {
        Self::Custom { name: name.into() }
    }

    pub fn tray(tray: u32, slot: u32, vial: u32) -> Self {
        Self::Tray(TrayCoord::new(tray, slot, vial))
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Self::NextEmptyVial | Self::NextFullVialAfter(_))
    }
}

impl fmt::Display for PositionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom { name } => write!(f, "custom '{}'", name),
            Self::Tray(coord) => write!(f, "{}", coord),
            Self::NextEmptyVial => f.write_str("next empty vial"),
            Self::NextFullVialAfter(coord) => write!(f, "next full vial after {}", coord),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tray_kind_geometry() {
        assert_eq!(TrayKind::Vt15.vial_count(), 15);
        assert_eq!(TrayKind::Vt54.max_volume_ml(), 2.0);
        assert_eq!(TrayKind::parse("vt70"), Some(TrayKind::Vt70));
        assert_eq!(TrayKind::parse("VT99"), None);
    }

    #[test]
    fn test_coord_ordering() {
        let a = TrayCoord::new(1, 2, 54);
        let b = TrayCoord::new(2, 1, 1);
        let c = TrayCoord::new(1, 3, 1);
        let mut coords = vec![b, c, a];
        coords.sort();
        assert_eq!(coords, vec![a, c, b]);
    }

    #[test]
    fn test_position_name() {
        let custom = Position::Custom(CustomPosition::new("cell1_we", CustomCapabilities::default()));
        let tray = Position::Tray {
            coord: TrayCoord::new(2, 1, 4),
            tray_kind: TrayKind::Vt54,
        };
        assert_eq!(custom.name(), "cell1_we");
        assert_eq!(tray.name(), TRAY_POSITION_NAME);
        assert_eq!(tray.capacity_ml(), Some(2.0));
        assert!(custom.coord().is_none());
    }

    #[test]
    fn test_capabilities_defaults_from_json() {
        let caps: CustomCapabilities = serde_json::from_str("{}").unwrap();
        assert!(caps.destination_allowed);
        assert!(!caps.assembly_allowed);
        assert!(!caps.always_destroys);
    }

    #[test]
    fn test_request_serialization() {
        let request = PositionRequest::NextFullVialAfter(TrayCoord::new(1, 1, 3));
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("next_full_vial_after"));
        let back: PositionRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, request);
        assert!(back.is_dynamic());
    }
}
