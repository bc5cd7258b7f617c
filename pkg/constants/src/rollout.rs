//! Rolling upgrade and reconciliation loop constants.

/// Default interval between two reconciliation ticks of one scale set.
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 30;

/// Default number of instances worked on concurrently within one extension level.
pub const DEFAULT_APPLY_CONCURRENCY: usize = 8;

/// Default per-instance budget for applying extensions (`PT1H30M`).
pub const DEFAULT_EXTENSIONS_TIME_BUDGET_SECS: u64 = 90 * 60;

/// Shortest accepted extensions time budget (`PT15M`).
pub const MIN_EXTENSIONS_TIME_BUDGET_SECS: u64 = 15 * 60;

/// Longest accepted extensions time budget (`PT2H`).
pub const MAX_EXTENSIONS_TIME_BUDGET_SECS: u64 = 2 * 60 * 60;

/// Longest accepted pause between two rolling upgrade batches (`P1D`).
pub const MAX_PAUSE_BETWEEN_BATCHES_SECS: u64 = 24 * 60 * 60;

/// Batch size used by the `Automatic` upgrade mode preset.
pub const AUTOMATIC_MAX_BATCH_PERCENT: u8 = 100;

/// Number of fleet events kept in the in-memory event log.
pub const EVENT_LOG_CAPACITY: usize = 1024;
