//! Grouping cells into placement units, and committing units to sites

pub mod incremental;
pub mod initial;
pub mod site;

pub use incremental::{pair_ff_ff, pair_lut_ff};
pub use initial::pack_initial;
pub use site::{PackingReport, SelectionPolicy, SitePacker};
