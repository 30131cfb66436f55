//! deribit-link library
//!
//! Command-line front end for the authenticated Deribit session in
//! `dlink-session`.

pub mod headless;
pub mod instruments;

// Re-export main entry points
pub use headless::runner::run_headless;
pub use instruments::run_instruments;
