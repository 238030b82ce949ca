//! Sporecache.
//!
//! Command line access to the data-freshness layer: load JSON resources through the
//! stale-while-revalidate cache and watch records that the backend is still filling in.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod commands;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
