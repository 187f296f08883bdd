//! Analytical placement and packing for island-style FPGAs.
//!
//! A design is first packed into placement units, then iteratively placed by alternating a
//! quadratic wirelength solve with density spreading, and finally assigned to device sites.
//! [`pipeline::place`] runs the whole flow.


pub mod config;
pub mod core;
pub mod error;
pub mod legalizer;
pub mod packing;
pub mod pipeline;
pub mod placement_unit;
pub mod placer;
pub mod timing;
