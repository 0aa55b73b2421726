//! Processing core for a self-hosted video library server.
//!
//! Wires together the job pipeline's pieces: a priority work queue per
//! phase, the feeder that claims pending rows and dispatches them, the
//! result handler that turns worker outcomes into durable state and the
//! next phase's submission, the retry scheduler and dead-letter queue, the
//! trash cleanup sweep, and the token-based auth layer. None of these are
//! started automatically; the embedding application constructs and spawns
//! the pieces it needs against its own `Lifecycle`.

pub mod auth;
pub mod config;
pub mod dlq;
pub mod error;
pub mod events;
pub mod feeder;
pub mod ids;
pub mod job;
pub mod lifecycle;
pub mod phase_tracker;
pub mod pool;
pub mod result_handler;
pub mod retry;
pub mod scene;
pub mod search;
pub mod submitter;
pub mod trash;

/// Embeds the reference schema migrations for the two stores this core
/// owns (`job_history`, `dlq_entries`), used both by `#[sqlx::test]` in
/// this crate and by embedding applications that want to run them as-is.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Convenience `tracing-subscriber` initializer for binaries that embed
/// this core. The core itself never calls this or installs a global
/// subscriber; it only offers the same `EnvFilter`-over-`fmt::layer()`
/// setup the host server uses, with a sensible default filter for this
/// crate's own targets.
pub fn init_tracing_subscriber() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reel_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
