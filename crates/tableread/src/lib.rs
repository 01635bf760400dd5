//! tableread: process and HTTP supervision for the dialogue-to-video render worker.

mod client;
mod config;
mod script;
mod supervisor;

pub mod stub;

pub use client::{ApiKey, WorkerClient};
pub use config::{SupervisorConfig, WorkerCommand};
pub use script::{Character, Line, RenderJob, Script, ScriptError};
pub use supervisor::{BackendSupervisor, SupervisorError, SupervisorState};

pub use reqwest::Url;

/// Install the process-wide tracing subscriber.
///
/// Honors `RUST_LOG` for filtering and `LOG_FORMAT=json` for structured
/// output. Logs go to stderr so stdout stays clean for program output. Safe
/// to call more than once; later calls are ignored.
pub fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        let _ = registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}
