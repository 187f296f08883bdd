use std::fmt::Display;

/// Fatal conditions a caller may want to match on. Everything else is reported through
/// `anyhow` context chains.
#[derive(Debug, PartialEq)]
pub enum PlacementError {
    /// A required configuration entry was not supplied
    MissingConfig(&'static str),
    /// A configuration entry is present but unusable
    InvalidConfig { name: &'static str, reason: String },
    /// Clock utilization exceeded a region budget while strict checking was requested
    ClockOverflow { violations: usize },
    /// A snapshot does not describe the current set of placement units
    SnapshotMismatch { expected: usize, found: usize },
}

impl std::error::Error for PlacementError {}

impl Display for PlacementError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingConfig(name) => {
                write!(f, "missing required configuration entry {:?}", name)
            }
            Self::InvalidConfig { name, reason } => {
                write!(f, "invalid configuration entry {:?}: {}", name, reason)
            }
            Self::ClockOverflow { violations } => {
                write!(f, "{} clock utilization violation(s)", violations)
            }
            Self::SnapshotMismatch { expected, found } => write!(
                f,
                "snapshot covers {} cells but the design has {}",
                found, expected
            ),
        }
    }
}
