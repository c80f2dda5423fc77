//! Pipeline phases, each independently testable:
//! - `prep`: kickstart rendering and build parameters
//! - `artifacts`: placing finished images in the output directory

pub mod artifacts;
pub mod prep;

pub use artifacts::{convert_raw, place_base, place_ova};
pub use prep::{assemble_parameters, read_template, render_kickstart, substitution_map};
