use serde::{Deserialize, Serialize};

use crate::config::Expansions;
use crate::error::Result;
use crate::seek::ShadowRegisters;
use crate::synth::{Cycle, DeltaSink, OutputTarget, TrebleEq};

/// Identifies each sound chip the facade owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChipKind {
    Apu,
    Vrc6,
    Vrc7,
    Fds,
    Mmc5,
    N163,
    S5B,
    Epsm,
}

impl ChipKind {
    pub const ALL: [ChipKind; 8] = [
        ChipKind::Apu,
        ChipKind::Vrc6,
        ChipKind::Vrc7,
        ChipKind::Fds,
        ChipKind::Mmc5,
        ChipKind::N163,
        ChipKind::S5B,
        ChipKind::Epsm,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ChipKind::Apu => "2a03",
            ChipKind::Vrc6 => "vrc6",
            ChipKind::Vrc7 => "vrc7",
            ChipKind::Fds => "fds",
            ChipKind::Mmc5 => "mmc5",
            ChipKind::N163 => "n163",
            ChipKind::S5B => "s5b",
            ChipKind::Epsm => "epsm",
        }
    }

    /// Expansion bit that activates this chip; the 2A03 is always active
    pub fn expansion(self) -> Option<Expansions> {
        match self {
            ChipKind::Apu => None,
            ChipKind::Vrc6 => Some(Expansions::VRC6),
            ChipKind::Vrc7 => Some(Expansions::VRC7),
            ChipKind::Fds => Some(Expansions::FDS),
            ChipKind::Mmc5 => Some(Expansions::MMC5),
            ChipKind::N163 => Some(Expansions::N163),
            ChipKind::S5B => Some(Expansions::S5B),
            ChipKind::Epsm => Some(Expansions::EPSM),
        }
    }

    pub fn is_active(self, expansions: Expansions) -> bool {
        self.expansion().is_none_or(|bit| expansions.contains(bit))
    }
}

/// Inclusive range of CPU addresses a chip decodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressWindow {
    pub start: u16,
    pub end: u16,
}

impl AddressWindow {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub const fn single(addr: u16) -> Self {
        Self {
            start: addr,
            end: addr,
        }
    }

    pub fn contains(&self, addr: u16) -> bool {
        (self.start..=self.end).contains(&addr)
    }
}

/// Common contract every emulated sound chip follows
///
/// Times passed to one chip must never decrease within a frame. `end_frame`
/// runs the chip to `time` and then makes `time` the new zero.
pub trait SoundChip {
    fn kind(&self) -> ChipKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Address windows this chip responds to
    fn windows(&self) -> &'static [AddressWindow];

    fn claims(&self, addr: u16) -> bool {
        self.windows().iter().any(|w| w.contains(addr))
    }

    /// Number of independently routable oscillators
    fn osc_count(&self) -> usize;

    /// Return to the power-on state; output assignments and volume survive
    fn reset(&mut self);

    /// Write a register at `time`. Addresses outside the chip's windows are ignored.
    fn write_register(
        &mut self,
        time: Cycle,
        addr: u16,
        value: u8,
        sink: &mut dyn DeltaSink,
    ) -> Result<()>;

    fn run_until(&mut self, time: Cycle, sink: &mut dyn DeltaSink) -> Result<()>;

    fn end_frame(&mut self, time: Cycle, sink: &mut dyn DeltaSink) -> Result<()>;

    fn set_output(&mut self, osc: usize, target: OutputTarget) -> Result<()>;

    fn set_volume(&mut self, volume: f64);

    fn set_treble_eq(&mut self, eq: TrebleEq);

    /// Record a write in the shadow table instead of applying it
    fn capture_write(&self, addr: u16, value: u8, shadow: &mut ShadowRegisters) {
        if self.claims(addr) {
            shadow.capture(self.kind(), addr, value);
        }
    }

    /// Real writes that reproduce the captured state, in the order they must happen
    fn replay_writes(&self, shadow: &ShadowRegisters) -> Vec<(u16, u8)> {
        shadow.entries(self.kind()).collect()
    }
}

/// Shared bookkeeping for oscillator output assignment
pub(crate) fn assign_output(
    chip: &'static str,
    outputs: &mut [OutputTarget],
    osc: usize,
    target: OutputTarget,
) -> Result<()> {
    match outputs.get_mut(osc) {
        Some(slot) => {
            *slot = target;
            Ok(())
        }
        None => Err(crate::error::ApuError::InvalidChannel { chip, index: osc }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_contains() {
        let window = AddressWindow::new(0x9000, 0x9003);
        assert!(window.contains(0x9000));
        assert!(window.contains(0x9003));
        assert!(!window.contains(0x9004));
        assert!(AddressWindow::single(0x4015).contains(0x4015));
    }

    #[test]
    fn test_native_chip_always_active() {
        assert!(ChipKind::Apu.is_active(Expansions::empty()));
        assert!(!ChipKind::Vrc6.is_active(Expansions::empty()));
        assert!(ChipKind::Vrc6.is_active(Expansions::VRC6 | Expansions::FDS));
    }

    #[test]
    fn test_assign_output_rejects_missing_oscillator() {
        let mut outputs = [None; 3];
        assert!(assign_output("vrc6", &mut outputs, 2, Some(1)).is_ok());
        assert_eq!(outputs[2], Some(1));
        assert!(assign_output("vrc6", &mut outputs, 3, Some(0)).is_err());
    }
}
