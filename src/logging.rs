//! Logging setup for hosts embedding the proxy layer.

use crate::config::ProxySettings;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

const FALLBACK_FILTER: &str = "gadget_dbus=info";

/// Pick the filter directives: `RUST_LOG` wins, then the configured
/// filter, then `gadget_dbus=info`. Blank values count as unset.
fn resolve_directives(env: Option<String>, configured: Option<&str>) -> String {
    env.filter(|value| !value.trim().is_empty())
        .or_else(|| {
            configured
                .filter(|value| !value.trim().is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| FALLBACK_FILTER.to_string())
}

fn build_filter(directives: &str) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .parse_lossy(directives)
}

/// Install a global fmt subscriber.
///
/// `filter` takes the usual `EnvFilter` directive syntax, e.g.
/// `gadget_dbus=debug`. When `RUST_LOG` is set it wins over `filter`.
/// Returns `false` if a global subscriber was already installed.
pub fn init_logging(filter: Option<&str>) -> bool {
    let directives = resolve_directives(std::env::var("RUST_LOG").ok(), filter);

    tracing_subscriber::fmt()
        .with_env_filter(build_filter(&directives))
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .is_ok()
}

/// [`init_logging`] with the `log_filter` of loaded settings.
///
/// ```no_run
/// let settings = gadget_dbus::ProxySettings::load(None).unwrap_or_default();
/// gadget_dbus::logging::init_logging_from(&settings);
/// ```
pub fn init_logging_from(settings: &ProxySettings) -> bool {
    init_logging(Some(&settings.log_filter))
}
