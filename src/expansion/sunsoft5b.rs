use log::trace;

use super::psg::{Psg, PSG_AMP_RANGE, PSG_VOICES};
use crate::chip::{AddressWindow, ChipKind, SoundChip};
use crate::error::{ensure_monotonic, ApuError, Result};
use crate::seek::ShadowRegisters;
use crate::synth::{Cycle, DeltaSink, FixedCycle, OutputTarget, Synth, TrebleEq};

pub const S5B_ADDRESS_PORT: u16 = 0xC000;
pub const S5B_DATA_PORT: u16 = 0xE000;

/// Tone half-periods under this many CPU cycles are muted to avoid pops
const POP_REDUCER_CYCLES: Cycle = 50;

static WINDOWS: [AddressWindow; 2] = [
    AddressWindow::single(S5B_ADDRESS_PORT),
    AddressWindow::single(S5B_DATA_PORT),
];

/// Sunsoft 5B (FME-7 audio): a YM2149-class PSG clocked from the CPU clock
pub struct Sunsoft5b {
    psg: Psg,
    latch: u8,
    synth: Synth,
}

impl Default for Sunsoft5b {
    fn default() -> Self {
        Self::new()
    }
}

impl Sunsoft5b {
    pub fn new() -> Self {
        Self {
            psg: Psg::new(FixedCycle::from_cycles(1), Some(POP_REDUCER_CYCLES)),
            latch: 0,
            synth: Synth::new(0.38, PSG_AMP_RANGE),
        }
    }

    pub fn psg(&self) -> &Psg {
        &self.psg
    }

    /// Register selected through $C000
    pub fn latch(&self) -> u8 {
        self.latch
    }
}

impl SoundChip for Sunsoft5b {
    fn kind(&self) -> ChipKind {
        ChipKind::S5B
    }

    fn windows(&self) -> &'static [AddressWindow] {
        &WINDOWS
    }

    fn osc_count(&self) -> usize {
        PSG_VOICES
    }

    fn reset(&mut self) {
        self.psg.reset();
        self.latch = 0;
    }

    fn write_register(
        &mut self,
        time: Cycle,
        addr: u16,
        value: u8,
        sink: &mut dyn DeltaSink,
    ) -> Result<()> {
        match addr {
            S5B_ADDRESS_PORT => {
                self.latch = value & 0x0F;
            }
            S5B_DATA_PORT => {
                ensure_monotonic(self.name(), time, self.psg.last_time())?;
                trace!("s5b: reg {:02X} = {:02X} at {}", self.latch, value, time);
                self.psg.write(time, self.latch, value, &self.synth, sink);
            }
            _ => {}
        }
        Ok(())
    }

    fn run_until(&mut self, time: Cycle, sink: &mut dyn DeltaSink) -> Result<()> {
        ensure_monotonic(self.name(), time, self.psg.last_time())?;
        self.psg.run(time, &self.synth, sink);
        Ok(())
    }

    fn end_frame(&mut self, time: Cycle, sink: &mut dyn DeltaSink) -> Result<()> {
        ensure_monotonic(self.name(), time, self.psg.last_time())?;
        self.psg.end_frame(time, &self.synth, sink);
        Ok(())
    }

    fn set_output(&mut self, osc: usize, target: OutputTarget) -> Result<()> {
        if self.psg.set_output(osc, target) {
            Ok(())
        } else {
            Err(ApuError::InvalidChannel {
                chip: self.name(),
                index: osc,
            })
        }
    }

    fn set_volume(&mut self, volume: f64) {
        self.synth.set_volume(volume);
    }

    fn set_treble_eq(&mut self, eq: TrebleEq) {
        self.synth.set_treble_eq(eq);
    }

    /// Data writes are keyed by the register the latch selects at that moment
    fn capture_write(&self, addr: u16, value: u8, shadow: &mut ShadowRegisters) {
        match addr {
            S5B_ADDRESS_PORT => shadow.set_latch(ChipKind::S5B, 0, value & 0x0F),
            S5B_DATA_PORT => {
                let reg = shadow.latch(ChipKind::S5B, 0).unwrap_or(self.latch);
                shadow.capture(ChipKind::S5B, reg as u16, value);
            }
            _ => {}
        }
    }

    fn replay_writes(&self, shadow: &ShadowRegisters) -> Vec<(u16, u8)> {
        let mut writes: Vec<(u16, u8)> = shadow
            .entries(ChipKind::S5B)
            .flat_map(|(reg, value)| [(S5B_ADDRESS_PORT, reg as u8), (S5B_DATA_PORT, value)])
            .collect();
        if let Some(latch) = shadow.latch(ChipKind::S5B, 0) {
            writes.push((S5B_ADDRESS_PORT, latch));
        }
        writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::{DeltaLog, NullSink};

    fn write(chip: &mut Sunsoft5b, time: Cycle, reg: u8, value: u8, sink: &mut dyn DeltaSink) {
        chip.write_register(time, S5B_ADDRESS_PORT, reg, sink).unwrap();
        chip.write_register(time, S5B_DATA_PORT, value, sink).unwrap();
    }

    #[test]
    fn test_latch_selects_register() {
        let mut chip = Sunsoft5b::new();
        write(&mut chip, 0, 0x08, 0x0C, &mut NullSink);
        assert_eq!(chip.psg().regs()[8], 0x0C);
        assert_eq!(chip.latch(), 0x08);
    }

    #[test]
    fn test_square_voice_is_audible() {
        let mut chip = Sunsoft5b::new();
        chip.set_output(1, Some(0)).unwrap();
        let mut log = DeltaLog::new();
        write(&mut chip, 0, 2, 0xFE, &mut log); // voice 1 period
        write(&mut chip, 0, 7, 0b0011_1101, &mut log); // voice 1 tone on
        write(&mut chip, 0, 9, 0x0F, &mut log);
        chip.end_frame(29_780, &mut log).unwrap();
        // 254 * 16 cycles per half period
        assert_eq!(log.len(), 29_780 / (254 * 16));
        assert!(log.deltas().iter().all(|d| d.target == 0));
    }

    #[test]
    fn test_invalid_voice() {
        let mut chip = Sunsoft5b::new();
        assert!(chip.set_output(3, Some(0)).is_err());
    }

    #[test]
    fn test_rejects_time_going_backwards() {
        let mut chip = Sunsoft5b::new();
        chip.run_until(100, &mut NullSink).unwrap();
        chip.write_register(50, S5B_ADDRESS_PORT, 0, &mut NullSink).unwrap();
        assert!(chip.write_register(50, S5B_DATA_PORT, 0, &mut NullSink).is_err());
    }

    #[test]
    fn test_shadow_replay_restores_registers() {
        let live_writes = [(0u8, 0x12u8), (8, 0x0F), (0, 0x34), (7, 0x38)];
        let mut live = Sunsoft5b::new();
        let mut seeking = Sunsoft5b::new();
        let mut shadow = ShadowRegisters::new();
        for &(reg, value) in &live_writes {
            write(&mut live, 0, reg, value, &mut NullSink);
            seeking.capture_write(S5B_ADDRESS_PORT, reg, &mut shadow);
            seeking.capture_write(S5B_DATA_PORT, value, &mut shadow);
        }
        for (addr, value) in seeking.replay_writes(&shadow) {
            seeking.write_register(0, addr, value, &mut NullSink).unwrap();
        }
        assert_eq!(live.psg().regs(), seeking.psg().regs());
        assert_eq!(live.latch(), seeking.latch());
    }
}
