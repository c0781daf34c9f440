//! 2A03 sound hardware: pulse, triangle, noise and DMC channels driven by the frame counter

mod apu;
mod dmc;
mod frame_counter;
mod noise;
mod pulse;
mod triangle;
mod units;

pub use apu::{
    Apu, ApuSnapshot, APU_OSC_COUNT, OSC_DMC, OSC_NOISE, OSC_PULSE1, OSC_PULSE2, OSC_TRIANGLE,
};
pub use dmc::{Dmc, SampleMemory};
pub use frame_counter::{FrameClocks, FrameCounter, SequencerKind, MMC5_FRAME_PERIOD};
pub use noise::Noise;
pub use pulse::Pulse;
pub use triangle::Triangle;
pub use units::{Envelope, LengthCounter, Sweep, LENGTH_COUNTER_TABLE};
