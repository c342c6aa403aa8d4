use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

// Held for the process lifetime so the non-blocking writer keeps flushing.
static GUARD: OnceCell<WorkerGuard> = OnceCell::new();

pub fn init_logging() {
    let filter: EnvFilter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stdout());
    let _ = GUARD.set(guard);

    let formatting_layer = fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_thread_ids(true)
        .with_target(true)
        .compact()
        .with_ansi(false)
        .with_writer(non_blocking_writer);

    let subscriber = Registry::default().with(filter).with(formatting_layer);

    // Ignore the error when a subscriber is already installed (tests).
    let _ = tracing::subscriber::set_global_default(subscriber);
}
