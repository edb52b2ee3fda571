//! Campo Sync - mobile order synchronization and import engine.
//!
//! Backend of the Campo field-sales back office. Field devices upload
//! orders and visit records captured offline; uploads are validated and
//! staged in `mobile_orders`, operators review them grouped per sales rep,
//! then import them into the canonical `orders` ledger or reject them. A
//! reconciliation pass detects ledger rows that skipped this workflow, and
//! every sync event lands in an append-only audit log.
//!
//! Flow: device payload -> [`sync::handle_device_sync`] -> staging ->
//! [`importer::get_import_groups`] + [`grouping::SelectionState`] ->
//! [`importer::import_selected`] / [`importer::reject_selected`] -> ledger.

use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod db;
pub mod grouping;
pub mod importer;
pub mod orphans;
pub mod staging;
pub mod sync;
pub mod sync_log;
pub mod validation;

/// Initialize structured logging (console + daily rolling file).
///
/// Returns the appender guard; hold it for the process lifetime — dropping
/// it flushes buffered log lines. Returns None when a global subscriber is
/// already set (e.g. by the embedding application).
pub fn init_logging(log_dir: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(log_dir).ok();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,campo_sync=debug"));

    let file_appender = tracing_appender::rolling::daily(log_dir, "campo");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok()
        .map(|_| guard)
}
