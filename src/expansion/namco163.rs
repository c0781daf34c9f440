use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::chip::{assign_output, AddressWindow, ChipKind, SoundChip};
use crate::error::{ensure_monotonic, Result};
use crate::seek::ShadowRegisters;
use crate::synth::{Cycle, DeltaSink, FixedCycle, OutputTarget, Synth, TrebleEq};

pub const N163_DATA_PORT: u16 = 0x4800;
pub const N163_ADDRESS_PORT: u16 = 0xF800;
pub const N163_MAX_VOICES: usize = 8;
pub const N163_RAM_SIZE: usize = 0x80;

/// CPU cycles the chip spends on each voice before moving to the next
pub const N163_CYCLES_PER_VOICE: u64 = 15;

/// Address-port bit that advances the address after each data access
const AUTO_INCREMENT: u8 = 0x80;

static WINDOWS: [AddressWindow; 2] = [
    AddressWindow::single(N163_DATA_PORT),
    AddressWindow::single(N163_ADDRESS_PORT),
];

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct N163Voice {
    delay: FixedCycle,
    last_amp: i32,
    wave_pos: u32,
}

/// Namco 163: up to eight wavetable voices sharing 128 bytes of RAM
///
/// Each voice owns 8 bytes at `0x40 + 8 * n`:
/// - 0, 2, 4 (bits 0-1): 18-bit frequency
/// - 4 (bits 2-7): wave length, `256 - (reg & 0xFC)` samples
/// - 6: wave start address in 4-bit samples
/// - 7: volume (bits 0-3); in the last voice bits 4-6 hold the active voice count - 1
///
/// Voice 0 here is the one at $78, which is always active.
pub struct Namco163 {
    ram: [u8; N163_RAM_SIZE],
    address: u8,
    voices: [N163Voice; N163_MAX_VOICES],
    outputs: [OutputTarget; N163_MAX_VOICES],
    last_time: Cycle,
    synth: Synth,
}

impl Default for Namco163 {
    fn default() -> Self {
        Self::new()
    }
}

impl Namco163 {
    pub fn new() -> Self {
        Self {
            ram: [0; N163_RAM_SIZE],
            address: 0,
            voices: [N163Voice::default(); N163_MAX_VOICES],
            outputs: [None; N163_MAX_VOICES],
            last_time: 0,
            synth: Synth::new(0.10, 225),
        }
    }

    pub fn ram(&self) -> &[u8; N163_RAM_SIZE] {
        &self.ram
    }

    /// Value of the address port
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Number of voices the chip cycles through, 1-8
    pub fn active_voices(&self) -> usize {
        ((self.ram[0x7F] >> 4) & 7) as usize + 1
    }

    /// Preset the voice-count bits of $7F; a later register write overrides them
    pub fn set_active_voices(&mut self, count: usize) {
        let bits = (count.clamp(1, N163_MAX_VOICES) - 1) as u8;
        self.ram[0x7F] = (self.ram[0x7F] & 0x8F) | (bits << 4);
    }

    fn voice_base(voice: usize) -> usize {
        0x78 - voice * 8
    }

    /// RAM cell at the address port, advancing it when auto-increment is set
    fn access(&mut self) -> &mut u8 {
        let addr = self.address & 0x7F;
        if self.address & AUTO_INCREMENT != 0 {
            self.address = ((addr + 1) & 0x7F) | AUTO_INCREMENT;
        }
        &mut self.ram[addr as usize]
    }

    /// $4800 read: RAM at the address port
    pub fn read_data(&mut self) -> u8 {
        *self.access()
    }

    fn sample(&self, nibble_addr: u32) -> i32 {
        let byte = self.ram[((nibble_addr >> 1) & 0x7F) as usize];
        let sample = if nibble_addr & 1 != 0 { byte >> 4 } else { byte & 0x0F };
        sample as i32
    }

    fn run_voices(&mut self, end_time: Cycle, sink: &mut dyn DeltaSink) {
        if end_time <= self.last_time {
            return;
        }
        let active = self.active_voices();
        let start = FixedCycle::from_cycles(self.last_time);
        let end = FixedCycle::from_cycles(end_time);

        for voice in 0..active {
            let base = Self::voice_base(voice);
            let regs = &self.ram[base..base + 8];
            let state = self.voices[voice];
            let output = self.outputs[voice];

            let mut time = start + state.delay;
            let mut delay = FixedCycle::ZERO;
            let volume = (regs[7] & 0x0F) as i32;
            let freq = ((regs[4] & 0x03) as u64) << 16 | (regs[2] as u64) << 8 | regs[0] as u64;
            let length = 256 - (regs[4] & 0xFC) as u32;
            let wave_addr = regs[6] as u32;

            // Very low frequencies would take thousands of frames per sample
            if time < end && volume != 0 && freq >= 64 * active as u64 {
                let period =
                    FixedCycle::from_ratio(N163_CYCLES_PER_VOICE * 65536 * active as u64, freq);
                let mut last_amp = state.last_amp;
                let mut wave_pos = state.wave_pos % length;
                while time < end {
                    let amp = self.sample((wave_pos + wave_addr) & 0xFF) * volume;
                    if amp != last_amp {
                        self.synth.offset(sink, output, time.whole(), last_amp, amp);
                        last_amp = amp;
                    }
                    wave_pos += 1;
                    if wave_pos >= length {
                        wave_pos = 0;
                    }
                    time += period;
                }
                self.voices[voice].wave_pos = wave_pos;
                self.voices[voice].last_amp = last_amp;
                delay = time - end;
            }
            self.voices[voice].delay = delay;
        }
        self.last_time = end_time;
    }
}

impl SoundChip for Namco163 {
    fn kind(&self) -> ChipKind {
        ChipKind::N163
    }

    fn windows(&self) -> &'static [AddressWindow] {
        &WINDOWS
    }

    fn osc_count(&self) -> usize {
        N163_MAX_VOICES
    }

    fn reset(&mut self) {
        self.ram = [0; N163_RAM_SIZE];
        self.address = 0;
        self.last_time = 0;
        for voice in self.voices.iter_mut() {
            voice.delay = FixedCycle::ZERO;
            voice.wave_pos = 0;
        }
    }

    fn write_register(
        &mut self,
        time: Cycle,
        addr: u16,
        value: u8,
        sink: &mut dyn DeltaSink,
    ) -> Result<()> {
        match addr {
            N163_ADDRESS_PORT => {
                self.address = value;
            }
            N163_DATA_PORT => {
                ensure_monotonic(self.name(), time, self.last_time)?;
                self.run_voices(time, sink);
                let before = self.active_voices();
                trace!("n163: ram {:02X} = {:02X} at {}", self.address & 0x7F, value, time);
                *self.access() = value;
                if self.active_voices() != before {
                    debug!("n163: {} active voices", self.active_voices());
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn run_until(&mut self, time: Cycle, sink: &mut dyn DeltaSink) -> Result<()> {
        ensure_monotonic(self.name(), time, self.last_time)?;
        self.run_voices(time, sink);
        Ok(())
    }

    fn end_frame(&mut self, time: Cycle, sink: &mut dyn DeltaSink) -> Result<()> {
        ensure_monotonic(self.name(), time, self.last_time)?;
        self.run_voices(time, sink);
        self.last_time -= time;
        Ok(())
    }

    fn set_output(&mut self, osc: usize, target: OutputTarget) -> Result<()> {
        let previous = self.outputs.get(osc).copied().flatten();
        assign_output(self.name(), &mut self.outputs, osc, target)?;
        if previous != target {
            self.voices[osc].last_amp = 0;
        }
        Ok(())
    }

    fn set_volume(&mut self, volume: f64) {
        self.synth.set_volume(volume);
    }

    fn set_treble_eq(&mut self, eq: TrebleEq) {
        self.synth.set_treble_eq(eq);
    }

    /// Data writes are keyed by RAM address, following auto-increment
    fn capture_write(&self, addr: u16, value: u8, shadow: &mut ShadowRegisters) {
        match addr {
            N163_ADDRESS_PORT => shadow.set_latch(ChipKind::N163, 0, value),
            N163_DATA_PORT => {
                let latch = shadow.latch(ChipKind::N163, 0).unwrap_or(self.address);
                let ram_addr = latch & 0x7F;
                shadow.capture(ChipKind::N163, ram_addr as u16, value);
                if latch & AUTO_INCREMENT != 0 {
                    let next = ((ram_addr + 1) & 0x7F) | AUTO_INCREMENT;
                    shadow.set_latch(ChipKind::N163, 0, next);
                } else {
                    shadow.set_latch(ChipKind::N163, 0, latch);
                }
            }
            _ => {}
        }
    }

    fn replay_writes(&self, shadow: &ShadowRegisters) -> Vec<(u16, u8)> {
        let mut writes: Vec<(u16, u8)> = shadow
            .entries(ChipKind::N163)
            .flat_map(|(ram_addr, value)| {
                [(N163_ADDRESS_PORT, ram_addr as u8), (N163_DATA_PORT, value)]
            })
            .collect();
        if let Some(latch) = shadow.latch(ChipKind::N163, 0) {
            writes.push((N163_ADDRESS_PORT, latch));
        }
        writes
    }
}
