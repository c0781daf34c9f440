//! Cartridge expansion sound chips

mod epsm;
mod fds;
mod fm;
mod mmc5;
mod namco163;
mod psg;
mod sunsoft5b;
mod vrc6;
mod vrc7;

pub use epsm::{
    Epsm, EPSM_ADDRESS_PORT_A, EPSM_ADDRESS_PORT_B, EPSM_DATA_PORT_A, EPSM_DATA_PORT_B,
    EPSM_FM_CHANNELS, EPSM_OSC_COUNT, OSC_EPSM_FM1,
};
pub use fds::{Fds, FDS_OSC_COUNT};
pub use fm::EnvelopePhase;
pub use mmc5::{Mmc5, MMC5_OSC_COUNT, OSC_MMC5_PCM, OSC_MMC5_PULSE1, OSC_MMC5_PULSE2};
pub use namco163::{
    Namco163, N163_ADDRESS_PORT, N163_CYCLES_PER_VOICE, N163_DATA_PORT, N163_MAX_VOICES,
    N163_RAM_SIZE,
};
pub use psg::{Psg, PSG_AMP_RANGE, PSG_VOICES, VOLUME_TABLE};
pub use sunsoft5b::{Sunsoft5b, S5B_ADDRESS_PORT, S5B_DATA_PORT};
pub use vrc6::{Vrc6, OSC_SAW, VRC6_OSC_COUNT};
pub use vrc7::{
    phase_increment as vrc7_phase_increment, Vrc7, VRC7_ADDRESS_PORT, VRC7_CHANNELS,
    VRC7_CONTROL_PORT, VRC7_DATA_PORT, VRC7_SAMPLE_PERIOD,
};
