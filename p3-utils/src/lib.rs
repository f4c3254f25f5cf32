pub mod error;
pub mod gate;

/// A timestamp value that has "never happened", used to initialize `Deadline`
/// and other monotonic-clock fields before the first real event.
pub const NEVER_HAPPENED_TICKS: i64 = -1;
