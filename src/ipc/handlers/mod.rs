pub mod core;
pub mod records;
pub mod runs;
pub mod setup;
