//! Resolves product images from the command line.
//!
//! Uses the same cache and origin probing as the ordering portal, which makes it handy to
//! check why a product shows a placeholder.

mod cli;
mod logging;
mod output;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
