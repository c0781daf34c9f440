//! Konami VRC7: a trimmed YM2413 (OPLL) with six 2-operator FM channels
//!
//! Registers, selected through $9010 and written through $9030:
//! - $00-$07: custom instrument, same layout as a ROM patch
//! - $10-$15: F-number low 8 bits
//! - $20-$25: `--SK BBBF` sustain, key, block, F-number bit 8
//! - $30-$35: `IIII VVVV` instrument, volume (attenuation in 3 dB steps)
//!
//! Patch bytes:
//! - 0, 1: modulator, carrier `AVEK MMMM` tremolo, vibrato, sustained, key rate scaling, multiplier
//! - 2: modulator `KKTT TTTT` key level scaling, total level
//! - 3: `KK-C DFFF` carrier key level scaling, carrier/modulator half-wave, feedback
//! - 4, 5: attack, decay rates
//! - 6, 7: sustain level, release rate

use log::{debug, trace};

use super::fm::{
    operator_output, sustain_attenuation, Envelope, EnvelopeClock, EnvelopePhase, EnvelopeRates,
    FM_AMP_RANGE, MAX_ATTENUATION,
};
use crate::chip::{AddressWindow, ChipKind, SoundChip};
use crate::error::{ensure_monotonic, ApuError, Result};
use crate::seek::ShadowRegisters;
use crate::synth::{Cycle, DeltaSink, OutputTarget, Synth, TrebleEq};

pub const VRC7_ADDRESS_PORT: u16 = 0x9010;
pub const VRC7_DATA_PORT: u16 = 0x9030;
/// Mapper control register; bit 6 silences the audio
pub const VRC7_CONTROL_PORT: u16 = 0xE000;

pub const VRC7_CHANNELS: usize = 6;

/// CPU cycles per FM sample (the 3.58 MHz chip clock over 72)
pub const VRC7_SAMPLE_PERIOD: Cycle = 36;

const REG_COUNT: usize = 0x40;

/// Built-in instruments 1-15
const ROM_PATCHES: [[u8; 8]; 15] = [
    [0x03, 0x21, 0x05, 0x06, 0xE8, 0x81, 0x42, 0x27],
    [0x13, 0x41, 0x14, 0x0D, 0xD8, 0xF6, 0x23, 0x12],
    [0x11, 0x11, 0x08, 0x08, 0xFA, 0xB2, 0x20, 0x12],
    [0x31, 0x61, 0x0C, 0x07, 0xA8, 0x64, 0x61, 0x27],
    [0x32, 0x21, 0x1E, 0x06, 0xE1, 0x76, 0x01, 0x28],
    [0x02, 0x01, 0x06, 0x00, 0xA3, 0xE2, 0xF4, 0xF4],
    [0x21, 0x61, 0x1D, 0x07, 0x82, 0x81, 0x11, 0x07],
    [0x23, 0x21, 0x22, 0x17, 0xA2, 0x72, 0x01, 0x17],
    [0x35, 0x11, 0x25, 0x00, 0x40, 0x73, 0x72, 0x01],
    [0xB5, 0x01, 0x0F, 0x0F, 0xA8, 0xA5, 0x51, 0x02],
    [0x17, 0xC1, 0x24, 0x07, 0xF8, 0xF8, 0x22, 0x12],
    [0x71, 0x23, 0x11, 0x06, 0x65, 0x74, 0x18, 0x16],
    [0x01, 0x02, 0xD3, 0x05, 0xC9, 0x95, 0x03, 0x02],
    [0x61, 0x63, 0x0C, 0x00, 0x94, 0xC0, 0x33, 0xF6],
    [0x21, 0x72, 0x0D, 0x00, 0xC1, 0xD5, 0x56, 0x06],
];

/// Frequency multiplier times two
const MULTIPLIER_X2: [u32; 16] = [1, 2, 4, 6, 8, 10, 12, 14, 16, 18, 20, 20, 24, 24, 30, 30];

/// Key level scaling at block 7 by F-number top bits, 0.375 dB units
const KSL_TABLE: [u16; 16] = [0, 24, 32, 37, 40, 43, 45, 47, 48, 50, 51, 52, 53, 54, 55, 56];

/// KSL register to shift of the table value; 0 turns scaling off
const KSL_SHIFT: [Option<u8>; 4] = [None, Some(2), Some(1), Some(0)];

/// Vibrato F-number offsets by F-number top 3 bits and LFO step
const PM_TABLE: [[i32; 8]; 8] = [
    [0, 0, 0, 0, 0, 0, 0, 0],
    [1, 0, 0, 0, -1, 0, 0, 0],
    [2, 1, 0, -1, -2, -1, 0, 1],
    [3, 1, 0, -1, -3, -1, 0, 1],
    [4, 2, 0, -2, -4, -2, 0, 2],
    [5, 2, 0, -2, -5, -2, 0, 2],
    [6, 3, 0, -3, -6, -3, 0, 3],
    [7, 3, 0, -3, -7, -3, 0, 3],
];

/// Tremolo triangle positions, one step every 64 samples
const AM_STEPS: u32 = 210;
const AM_STEP_SAMPLES: u32 = 64;
/// Vibrato steps every 1024 samples
const PM_STEP_SAMPLES: u32 = 1024;
/// Both LFOs line up again after this many samples
const LFO_CYCLE_SAMPLES: u32 = 860_160;

/// Release rate used while the channel's sustain bit is set
const SUSTAIN_RELEASE_RATE: u8 = 5;
/// Key-off release of percussive patches
const PERCUSSIVE_RELEASE_RATE: u8 = 7;

static WINDOWS: [AddressWindow; 3] = [
    AddressWindow::single(VRC7_ADDRESS_PORT),
    AddressWindow::single(VRC7_DATA_PORT),
    AddressWindow::single(VRC7_CONTROL_PORT),
];

/// 19-bit phase step per sample
pub fn phase_increment(fnum: u32, block: u8, multiplier: u8) -> u32 {
    ((fnum * MULTIPLIER_X2[(multiplier & 0x0F) as usize]) << block) >> 1
}

/// 4-bit register rate to an effective 6-bit rate
fn opll_rate(rate: u8, rks: u8) -> u8 {
    if rate == 0 { 0 } else { (rate * 4 + rks).min(63) }
}

fn ksl_attenuation(fnum: u32, block: u8, ksl: u8) -> u16 {
    match KSL_SHIFT[(ksl & 3) as usize] {
        None => 0,
        Some(shift) => {
            let level = KSL_TABLE[(fnum >> 5) as usize & 0x0F];
            let level = level.saturating_sub(8 * (7 - block as u16));
            (level >> shift) * 4
        }
    }
}

/// Per-sample inputs shared by every channel
#[derive(Debug, Clone, Copy)]
struct SampleContext {
    clock: EnvelopeClock,
    /// 0-52 envelope units
    am: u16,
    pm_step: usize,
}

/// Frequency, key and level registers of one channel
#[derive(Debug, Clone, Copy)]
struct ChannelRegs {
    fnum: u32,
    block: u8,
    sustain: bool,
    volume: u8,
}

#[derive(Debug, Clone, Copy, Default)]
struct OpllSlot {
    /// 19-bit phase accumulator
    phase: u32,
    envelope: Envelope,
}

#[derive(Debug, Clone, Default)]
struct OpllChannel {
    /// Modulator, carrier
    slots: [OpllSlot; 2],
    key: bool,
    feedback_history: [i32; 2],
    last_amp: i32,
}

impl OpllChannel {
    fn set_key(&mut self, on: bool) {
        if on == self.key {
            return;
        }
        self.key = on;
        for slot in self.slots.iter_mut() {
            if on {
                slot.phase = 0;
                slot.envelope.key_on();
            } else {
                slot.envelope.key_off();
            }
        }
    }

    fn is_silent(&self) -> bool {
        self.slots.iter().all(|slot| slot.envelope.is_silent())
    }

    fn clock(&mut self, patch: &[u8; 8], regs: ChannelRegs, ctx: SampleContext) -> i32 {
        let mut attenuation = [MAX_ATTENUATION; 2];
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let flags = patch[index];
            let fnum = if flags & 0x40 != 0 {
                let offset = PM_TABLE[(regs.fnum >> 6) as usize & 7][ctx.pm_step];
                (regs.fnum as i32 + offset).clamp(0, 0x1FF) as u32
            } else {
                regs.fnum
            };
            slot.phase = (slot.phase + phase_increment(fnum, regs.block, flags)) & 0x7_FFFF;

            let rks = (regs.block << 1) | (regs.fnum >> 8) as u8;
            let rks = if flags & 0x10 != 0 { rks } else { rks >> 2 };
            let sustained = flags & 0x20 != 0;
            let release = patch[6 + index] & 0x0F;
            let key_off_rate = if regs.sustain {
                SUSTAIN_RELEASE_RATE
            } else if sustained {
                release
            } else {
                PERCUSSIVE_RELEASE_RATE
            };
            let rates = EnvelopeRates {
                attack: opll_rate(patch[4 + index] >> 4, rks),
                decay: opll_rate(patch[4 + index] & 0x0F, rks),
                sustain: if sustained { 0 } else { opll_rate(release, rks) },
                release: opll_rate(key_off_rate, rks),
                sustain_level: sustain_attenuation(patch[6 + index] >> 4),
            };
            slot.envelope.step(&rates, ctx.clock);

            let level = if index == 0 {
                ((patch[2] & 0x3F) as u16) << 3
            } else {
                (regs.volume as u16) << 5
            };
            let ksl = ksl_attenuation(regs.fnum, regs.block, patch[2 + index] >> 6);
            let tremolo = if flags & 0x80 != 0 { ctx.am } else { 0 };
            attenuation[index] =
                (slot.envelope.level() + level + ksl + tremolo).min(MAX_ATTENUATION);
        }

        let feedback = match patch[3] & 0x07 {
            0 => 0,
            fb => (self.feedback_history[0] + self.feedback_history[1]) >> (9 - fb as i32),
        };
        let modulator_phase = ((self.slots[0].phase >> 9) as i32 + feedback) as u32;
        let modulator = operator_output(modulator_phase, attenuation[0], patch[3] & 0x08 != 0);
        let carrier_phase = ((self.slots[1].phase >> 9) as i32 + (modulator >> 1)) as u32;
        let carrier = operator_output(carrier_phase, attenuation[1], patch[3] & 0x10 != 0);

        self.feedback_history = [modulator, self.feedback_history[0]];
        carrier
    }
}

/// VRC7 sound: register file, six FM channels and the shared LFOs
pub struct Vrc7 {
    regs: [u8; REG_COUNT],
    latch: u8,
    /// $E000 bit 6
    silenced: bool,
    channels: [OpllChannel; VRC7_CHANNELS],
    outputs: [OutputTarget; VRC7_CHANNELS],
    envelope_clock: EnvelopeClock,
    lfo_samples: u32,
    next_sample: Cycle,
    last_time: Cycle,
    synth: Synth,
}

impl Default for Vrc7 {
    fn default() -> Self {
        Self::new()
    }
}

impl Vrc7 {
    pub fn new() -> Self {
        Self {
            regs: [0; REG_COUNT],
            latch: 0,
            silenced: false,
            channels: Default::default(),
            outputs: [None; VRC7_CHANNELS],
            envelope_clock: EnvelopeClock::default(),
            lfo_samples: 0,
            next_sample: 0,
            last_time: 0,
            synth: Synth::new(0.16, FM_AMP_RANGE),
        }
    }

    pub fn regs(&self) -> &[u8; REG_COUNT] {
        &self.regs
    }

    /// Register selected through $9010
    pub fn latch(&self) -> u8 {
        self.latch
    }

    pub fn is_silenced(&self) -> bool {
        self.silenced
    }

    /// Patch bytes of an instrument; 0 is the custom instrument
    pub fn patch(&self, instrument: u8) -> [u8; 8] {
        match instrument & 0x0F {
            0 => {
                let mut patch = [0; 8];
                patch.copy_from_slice(&self.regs[..8]);
                patch
            }
            n => ROM_PATCHES[n as usize - 1],
        }
    }

    pub fn key_on(&self, channel: usize) -> bool {
        self.channels.get(channel).is_some_and(|ch| ch.key)
    }

    /// Carrier envelope phase of a channel
    pub fn envelope_phase(&self, channel: usize) -> Option<EnvelopePhase> {
        self.channels
            .get(channel)
            .map(|ch| ch.slots[1].envelope.phase())
    }

    /// Amplitude last sent for a channel
    pub fn channel_level(&self, channel: usize) -> i32 {
        self.channels.get(channel).map_or(0, |ch| ch.last_amp)
    }

    fn channel_regs(&self, channel: usize) -> ChannelRegs {
        let control = self.regs[0x20 + channel];
        ChannelRegs {
            fnum: ((control as u32 & 0x01) << 8) | self.regs[0x10 + channel] as u32,
            block: (control >> 1) & 0x07,
            sustain: control & 0x20 != 0,
            volume: self.regs[0x30 + channel] & 0x0F,
        }
    }

    fn clock_sample(&mut self, time: Cycle, sink: &mut dyn DeltaSink) {
        self.envelope_clock.tick();
        self.lfo_samples = (self.lfo_samples + 1) % LFO_CYCLE_SAMPLES;
        let am_position = (self.lfo_samples / AM_STEP_SAMPLES) % AM_STEPS;
        let am_level = if am_position < AM_STEPS / 2 {
            am_position / 4
        } else {
            (AM_STEPS - 1 - am_position) / 4
        };
        let ctx = SampleContext {
            clock: self.envelope_clock,
            am: am_level as u16 * 2,
            pm_step: ((self.lfo_samples / PM_STEP_SAMPLES) % 8) as usize,
        };

        for index in 0..VRC7_CHANNELS {
            let regs = self.channel_regs(index);
            let patch = self.patch(self.regs[0x30 + index] >> 4);
            let channel = &mut self.channels[index];
            let amp = if channel.is_silent() {
                0
            } else {
                let amp = channel.clock(&patch, regs, ctx);
                if self.silenced { 0 } else { amp }
            };
            self.synth
                .offset(sink, self.outputs[index], time, channel.last_amp, amp);
            channel.last_amp = amp;
        }
    }

    fn run_channels(&mut self, end_time: Cycle, sink: &mut dyn DeltaSink) {
        if end_time <= self.last_time {
            return;
        }
        while self.next_sample < end_time {
            self.clock_sample(self.next_sample, sink);
            self.next_sample += VRC7_SAMPLE_PERIOD;
        }
        self.last_time = end_time;
    }

    fn write_data(&mut self, value: u8) {
        let reg = self.latch as usize;
        self.regs[reg] = value;
        if (0x20..=0x25).contains(&reg) {
            self.channels[reg - 0x20].set_key(value & 0x10 != 0);
        }
    }
}

impl SoundChip for Vrc7 {
    fn kind(&self) -> ChipKind {
        ChipKind::Vrc7
    }

    fn windows(&self) -> &'static [AddressWindow] {
        &WINDOWS
    }

    fn osc_count(&self) -> usize {
        VRC7_CHANNELS
    }

    fn reset(&mut self) {
        self.regs = [0; REG_COUNT];
        self.latch = 0;
        self.silenced = false;
        for channel in self.channels.iter_mut() {
            *channel = OpllChannel::default();
        }
        self.envelope_clock = EnvelopeClock::default();
        self.lfo_samples = 0;
        self.next_sample = 0;
        self.last_time = 0;
    }

    fn write_register(
        &mut self,
        time: Cycle,
        addr: u16,
        value: u8,
        sink: &mut dyn DeltaSink,
    ) -> Result<()> {
        match addr {
            VRC7_ADDRESS_PORT => self.latch = value & 0x3F,
            VRC7_DATA_PORT => {
                ensure_monotonic(self.name(), time, self.last_time)?;
                self.run_channels(time, sink);
                trace!("vrc7: reg {:02X} = {:02X} at {}", self.latch, value, time);
                self.write_data(value);
            }
            VRC7_CONTROL_PORT => {
                ensure_monotonic(self.name(), time, self.last_time)?;
                self.run_channels(time, sink);
                let silenced = value & 0x40 != 0;
                if silenced != self.silenced {
                    debug!("vrc7: audio {}", if silenced { "silenced" } else { "enabled" });
                }
                self.silenced = silenced;
            }
            _ => {}
        }
        Ok(())
    }

    fn run_until(&mut self, time: Cycle, sink: &mut dyn DeltaSink) -> Result<()> {
        ensure_monotonic(self.name(), time, self.last_time)?;
        self.run_channels(time, sink);
        Ok(())
    }

    fn end_frame(&mut self, time: Cycle, sink: &mut dyn DeltaSink) -> Result<()> {
        ensure_monotonic(self.name(), time, self.last_time)?;
        self.run_channels(time, sink);
        self.next_sample -= time;
        self.last_time -= time;
        Ok(())
    }

    fn set_output(&mut self, osc: usize, target: OutputTarget) -> Result<()> {
        match self.outputs.get_mut(osc) {
            Some(slot) => {
                if *slot != target {
                    self.channels[osc].last_amp = 0;
                }
                *slot = target;
                Ok(())
            }
            None => Err(ApuError::InvalidChannel {
                chip: self.name(),
                index: osc,
            }),
        }
    }

    fn set_volume(&mut self, volume: f64) {
        self.synth.set_volume(volume);
    }

    fn set_treble_eq(&mut self, eq: TrebleEq) {
        self.synth.set_treble_eq(eq);
    }

    /// Data writes are keyed by the register selected at that moment
    fn capture_write(&self, addr: u16, value: u8, shadow: &mut ShadowRegisters) {
        match addr {
            VRC7_ADDRESS_PORT => shadow.set_latch(ChipKind::Vrc7, 0, value & 0x3F),
            VRC7_DATA_PORT => {
                let reg = shadow.latch(ChipKind::Vrc7, 0).unwrap_or(self.latch);
                shadow.capture(ChipKind::Vrc7, reg as u16, value);
            }
            VRC7_CONTROL_PORT => shadow.capture(ChipKind::Vrc7, VRC7_CONTROL_PORT, value),
            _ => {}
        }
    }

    fn replay_writes(&self, shadow: &ShadowRegisters) -> Vec<(u16, u8)> {
        let mut writes = Vec::new();
        for (reg, value) in shadow.entries(ChipKind::Vrc7) {
            if reg == VRC7_CONTROL_PORT {
                writes.push((VRC7_CONTROL_PORT, value));
            } else {
                writes.push((VRC7_ADDRESS_PORT, reg as u8));
                writes.push((VRC7_DATA_PORT, value));
            }
        }
        if let Some(latch) = shadow.latch(ChipKind::Vrc7, 0) {
            writes.push((VRC7_ADDRESS_PORT, latch));
        }
        writes
    }
}
