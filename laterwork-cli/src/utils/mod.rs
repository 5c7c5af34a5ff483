pub mod args;
pub mod display;

pub use args::*;
pub use display::*;
