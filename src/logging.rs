//! Logging setup for the CLI.
//!
//! Console output goes to stderr so reports printed on stdout stay
//! machine-readable. A batch run additionally appends to a plain-text log
//! file in its output directory.
//!
//! The level defaults to `info`; `-v`/`-q` move it up or down and `RUST_LOG`
//! overrides both:
//!
//! ```bash
//! RUST_LOG=autotrack=debug autotrack run footage/ scenes/
//! ```

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

use crate::error::AutotrackError;

/// Level for a verbosity offset: 0 is `info`, positive is chattier.
pub fn level_for(verbosity: i8) -> LevelFilter {
    match verbosity {
        i8::MIN..=-2 => LevelFilter::ERROR,
        -1 => LevelFilter::WARN,
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Install the global subscriber.
pub fn init(verbosity: i8, log_file: Option<&Path>) -> Result<(), AutotrackError> {
    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_target(true),
            )
        }
        None => None,
    };

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(!cfg!(windows))
        .with_target(false);

    let filter = EnvFilter::builder()
        .with_default_directive(level_for(verbosity).into())
        .from_env_lossy();

    let collector = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(filter);
    tracing::subscriber::set_global_default(collector)
        .map_err(|err| AutotrackError::Io(std::io::Error::other(err)))?;

    if let Some(path) = log_file {
        tracing::debug!(path = %path.display(), "appending to log file");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(level_for(-3), LevelFilter::ERROR);
        assert_eq!(level_for(-1), LevelFilter::WARN);
        assert_eq!(level_for(0), LevelFilter::INFO);
        assert_eq!(level_for(1), LevelFilter::DEBUG);
        assert_eq!(level_for(4), LevelFilter::TRACE);
    }
}
