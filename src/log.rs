//! Logging from the bunker.

use std::fmt;

use camino::Utf8Path;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::Layer as FmtLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload::Handle;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

//----------- Logger -----------------------------------------------------------

/// The state of the bunker logger.
pub struct Logger {
    filter: Handle<EnvFilter, Registry>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("filter", &self.filter)
            .finish()
    }
}

/// Where log output goes.
#[derive(Clone, Debug, Default)]
pub enum LogTarget {
    /// A logger to stdout.
    Stdout,

    /// A logger to stderr.
    #[default]
    Stderr,

    /// An append-mode file logger.
    File(Box<Utf8Path>),
}

impl Logger {
    /// Launch the bunker logger.
    ///
    /// The target is fixed for the lifetime of the process; the filter can be
    /// changed later through [`Logger::apply`].
    ///
    /// ## Panics
    ///
    /// Panics if a global [`tracing`] logger has been set already.
    pub fn launch(target: &LogTarget, verbose: bool) -> Result<&'static Logger, String> {
        let filter = make_env_filter(verbose)?;

        // A reload layer is tracing's way of making it possible to change
        // values at runtime. It gives us a handle we can use to update the
        // EnvFilter when the configuration changes.
        let (filter, filter_handle) = reload::Layer::new(filter);

        match target {
            LogTarget::File(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path.as_std_path())
                    .map_err(|e| format!("cannot open log file '{path}': {e}"))?;

                // We never emit colors to files.
                let layer = FmtLayer::new().with_ansi(false).with_writer(file);
                tracing_subscriber::registry()
                    .with(filter)
                    .with(layer)
                    .init()
            }
            LogTarget::Stdout => {
                let layer = FmtLayer::new()
                    .with_ansi(supports_color::on(supports_color::Stream::Stdout).is_some())
                    .with_writer(std::io::stdout);
                tracing_subscriber::registry()
                    .with(filter)
                    .with(layer)
                    .init()
            }
            LogTarget::Stderr => {
                let layer = FmtLayer::new()
                    .with_ansi(supports_color::on(supports_color::Stream::Stderr).is_some())
                    .with_writer(std::io::stderr);
                tracing_subscriber::registry()
                    .with(filter)
                    .with(layer)
                    .init()
            }
        };

        Ok(Box::leak(Box::new(Self {
            filter: filter_handle,
        })))
    }

    /// Reload the filter, e.g. after the configuration changed.
    pub fn apply(&self, verbose: bool) -> Result<(), String> {
        self.filter
            .reload(make_env_filter(verbose)?)
            .map_err(|_| "could not reload filter".into())
    }
}

/// Make a new [`EnvFilter`].
///
/// The configured level is the default; directives from the `RUST_LOG`
/// environment variable are layered on top.
fn make_env_filter(verbose: bool) -> Result<EnvFilter, String> {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let mut filter = EnvFilter::default().add_directive(level.into());

    if let Ok(directives) = std::env::var(EnvFilter::DEFAULT_ENV) {
        for directive in directives.split(',').filter(|s| !s.is_empty()) {
            filter = filter.add_directive(
                directive
                    .parse()
                    .map_err(|_| format!("invalid log directive: '{directive}'"))?,
            );
        }
    }

    Ok(filter)
}
