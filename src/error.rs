use crate::synth::Cycle;

/// Error types for sound chip operations
///
/// Only caller-contract violations are reported here. Hardware-level oddities
/// (a DMC fetch with no memory attached, unsupported PSG modes) degrade the
/// affected channel instead of failing.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ApuError {
    /// A write or run request arrived with a timestamp earlier than the last one processed
    #[error("{chip}: time {time} is earlier than last processed time {last}")]
    TimeWentBackwards {
        chip: &'static str,
        time: Cycle,
        last: Cycle,
    },

    /// Operation that cannot be performed while register writes are being shadowed
    #[error("{0} is not allowed while seeking")]
    SeekInProgress(&'static str),

    /// `stop_seeking` without a matching `start_seeking`
    #[error("not seeking")]
    NotSeeking,

    /// Output assignment to an oscillator the chip does not have
    #[error("{chip} has no oscillator {index}")]
    InvalidChannel { chip: &'static str, index: usize },

    /// Output assignment to a buffer the facade does not own
    #[error("no output buffer {index} (have {count})")]
    InvalidBuffer { index: usize, count: usize },

    /// `end_frame` was asked to end a frame before time already consumed
    #[error("frame length {frame_length} is shorter than elapsed clock {clock}")]
    FrameOverrun { clock: Cycle, frame_length: Cycle },

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type for sound chip operations
pub type Result<T> = std::result::Result<T, ApuError>;

/// Fails with [`ApuError::TimeWentBackwards`] when `time` precedes `last`
pub(crate) fn ensure_monotonic(chip: &'static str, time: Cycle, last: Cycle) -> Result<()> {
    if time < last {
        return Err(ApuError::TimeWentBackwards { chip, time, last });
    }
    Ok(())
}
