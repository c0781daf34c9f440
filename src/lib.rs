//! Cycle-accurate NES sound: the 2A03 APU and the cartridge expansion chips
//!
//! [`NesSound`] takes CPU-bus register writes with cycle timestamps and
//! turns them into band-limited amplitude steps in one or more accumulation
//! buffers. The individual chips are usable on their own through
//! [`SoundChip`].

pub mod apu;
pub mod chip;
pub mod config;
pub mod error;
pub mod expansion;
pub mod nes;
pub mod seek;
pub mod synth;

pub use apu::{Apu, ApuSnapshot, SampleMemory};
pub use chip::{AddressWindow, ChipKind, SoundChip};
pub use config::{ApuConfig, Expansions, TvSystem};
pub use error::{ApuError, Result};
pub use nes::NesSound;
pub use seek::{SeekState, ShadowRegisters};
pub use synth::{
    AccumulationBuffer, Cycle, DeltaLog, DeltaSink, NullSink, OutputTarget, Synth, TrebleEq,
};
