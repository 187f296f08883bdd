pub mod design;
pub mod device;
mod ids;
mod resources;

pub use ids::{CellId, NetId, PinId, SiteId};
pub use resources::{ResourceKind, Resources};

use std::fmt::{Display, Formatter};
use std::path::Path;

use anyhow::{Context, Result};

/// Number of distinct clock nets that may enter one half-height column of a clock region.
pub const CLOCK_SLOTS_PER_HALF_COLUMN: u32 = 12;

/// Number of distinct clock nets that may enter a whole clock region.
pub const CLOCK_SLOTS_PER_REGION: u32 = 24;

/// Error generated when a device or design description is internally inconsistent
#[derive(Debug, PartialEq)]
pub enum ModelError {
    /// Two objects of the same namespace share a name
    DuplicateName(String),
    /// A net has more than one driving pin
    MultipleDrivers { net: String },
    /// An index refers past the end of its table
    DanglingReference { what: &'static str, index: usize },
    /// A site lies outside of the device extents
    SiteOutOfBounds { x: u32, y: u32 },
}

impl Display for ModelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Self::DuplicateName(s) => write!(f, "duplicate name {:?}", s),
            Self::MultipleDrivers { net } => write!(f, "net {:?} has more than one driver", net),
            Self::DanglingReference { what, index } => {
                write!(f, "{} index {} does not exist", what, index)
            }
            Self::SiteOutOfBounds { x, y } => {
                write!(f, "site at ({}, {}) lies outside of the device", x, y)
            }
        }
    }
}

impl std::error::Error for ModelError {}

/// Read a JSON document from disk and deserialize it.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {:?} for reading", path))?;
    serde_json::from_reader(std::io::BufReader::new(file))
        .with_context(|| format!("Failed to parse {:?}", path))
}
