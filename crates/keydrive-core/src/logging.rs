//! Process-wide logger installation.

use log::LevelFilter;

/// Verbosity steps, quietest first.
const LEVELS: &[LevelFilter] = &[
    LevelFilter::Error,
    LevelFilter::Warn,
    LevelFilter::Info,
    LevelFilter::Debug,
    LevelFilter::Trace,
];

/// Install `env_logger` at `default_level` unless `RUST_LOG` overrides it.
///
/// Calling this more than once is harmless; later calls are ignored.
pub fn init(default_level: &str) {
    let env = env_logger::Env::default().default_filter_or(default_level);
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp(None)
        .try_init();
}

/// Shift `base` by `verbose - quiet` steps and return the resulting filter name.
pub fn adjusted_level(base: LevelFilter, verbose: u8, quiet: u8) -> LevelFilter {
    let start = LEVELS.iter().position(|lvl| *lvl == base).unwrap_or(2) as i32;
    let shifted = (start + i32::from(verbose) - i32::from(quiet))
        .clamp(0, LEVELS.len() as i32 - 1);
    LEVELS[shifted as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_flags_shift_around_info() {
        assert_eq!(adjusted_level(LevelFilter::Info, 0, 0), LevelFilter::Info);
        assert_eq!(adjusted_level(LevelFilter::Info, 1, 0), LevelFilter::Debug);
        assert_eq!(adjusted_level(LevelFilter::Info, 0, 1), LevelFilter::Warn);
        assert_eq!(adjusted_level(LevelFilter::Info, 5, 0), LevelFilter::Trace);
        assert_eq!(adjusted_level(LevelFilter::Info, 0, 9), LevelFilter::Error);
        assert_eq!(adjusted_level(LevelFilter::Info, 2, 1), LevelFilter::Debug);
    }
}
