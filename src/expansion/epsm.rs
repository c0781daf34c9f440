//! EPSM: a YM2608 (OPNA) on the expansion port
//!
//! Port A ($401C address, $401D data) reaches the SSG registers 0x00-0x0F,
//! the rhythm unit 0x10-0x1F and FM channels 1-3. Port B ($401E/$401F)
//! reaches FM channels 4-6. The rhythm unit and the ADPCM unit have no
//! sample ROM here; writes to them are accepted and dropped.

use log::{debug, trace, warn};

use super::fm::{
    clamp_amp, effective_rate, operator_output, sustain_attenuation, Envelope, EnvelopeClock,
    EnvelopeRates, FM_AMP_RANGE, MAX_ATTENUATION,
};
use super::psg::{Psg, PSG_AMP_RANGE, PSG_VOICES};
use crate::chip::{AddressWindow, ChipKind, SoundChip};
use crate::error::{ensure_monotonic, ApuError, Result};
use crate::seek::ShadowRegisters;
use crate::synth::{Cycle, DeltaSink, FixedCycle, OutputTarget, Synth, TrebleEq};

pub const EPSM_ADDRESS_PORT_A: u16 = 0x401C;
pub const EPSM_DATA_PORT_A: u16 = 0x401D;
pub const EPSM_ADDRESS_PORT_B: u16 = 0x401E;
pub const EPSM_DATA_PORT_B: u16 = 0x401F;

pub const EPSM_FM_CHANNELS: usize = 6;
pub const EPSM_OSC_COUNT: usize = PSG_VOICES + EPSM_FM_CHANNELS;
/// First FM oscillator; 0-2 are the SSG voices
pub const OSC_EPSM_FM1: usize = PSG_VOICES;

const CPU_CLOCK: u64 = 1_789_773;
const MASTER_CLOCK: u64 = 8_000_000;

/// CPU time of one SSG tick (master / 2)
const SSG_TICK: FixedCycle = FixedCycle::from_ratio(CPU_CLOCK, MASTER_CLOCK / 2);
/// One FM sample every 144 master clocks
const FM_SAMPLE_PERIOD: FixedCycle = FixedCycle::from_ratio(CPU_CLOCK * 144, MASTER_CLOCK);

/// Register offset of operators 1-4 within a channel's operator block
const OP_REG_OFFSETS: [usize; 4] = [0, 8, 4, 12];

const DETUNE_TABLE: [[u8; 4]; 32] = [
    [0, 0, 1, 2], [0, 0, 1, 2], [0, 0, 1, 2], [0, 0, 1, 2],
    [0, 1, 2, 2], [0, 1, 2, 3], [0, 1, 2, 3], [0, 1, 2, 3],
    [0, 1, 2, 4], [0, 1, 3, 4], [0, 1, 3, 4], [0, 1, 3, 5],
    [0, 2, 4, 5], [0, 2, 4, 6], [0, 2, 4, 6], [0, 2, 5, 7],
    [0, 2, 5, 8], [0, 3, 6, 8], [0, 3, 6, 9], [0, 3, 7, 10],
    [0, 4, 8, 11], [0, 4, 8, 12], [0, 4, 9, 13], [0, 5, 10, 14],
    [0, 5, 11, 16], [0, 6, 12, 17], [0, 6, 13, 19], [0, 7, 14, 20],
    [0, 8, 16, 22], [0, 8, 16, 22], [0, 8, 16, 22], [0, 8, 16, 22],
];

/// Samples per LFO step for each $22 frequency setting
const LFO_DIVIDER_TABLE: [u16; 8] = [108, 77, 71, 67, 62, 44, 8, 5];

/// Vibrato depth per PMS setting, in 1/1024 of the F-number at the triangle peak
const PM_DEPTH: [i32; 8] = [0, 2, 4, 6, 8, 12, 24, 48];

/// Tremolo shift per AMS setting; `None` disables it
const AM_SHIFT: [Option<u8>; 4] = [None, Some(3), Some(1), Some(0)];

/// Shadow slot flag for port B registers
const PORT_B_SLOT: u16 = 0x100;
/// Shadow slots for the $28 key register, one per channel code
const KEY_ON_SLOT: u16 = 0x200;

/// 5-bit key code from F-number and block, for detune and rate scaling
fn key_code(fnum: u32, block: u8) -> u8 {
    let f11 = (fnum >> 10) & 1;
    let f10 = (fnum >> 9) & 1;
    let f9 = (fnum >> 8) & 1;
    let f8 = (fnum >> 7) & 1;
    let bit0 = (f11 & (f10 | f9 | f8)) | ((f11 ^ 1) & f10 & f9 & f8);
    ((block as u32) << 2 | f11 << 1 | bit0) as u8
}

/// LFO outputs for one sample
#[derive(Debug, Clone, Copy, Default)]
struct LfoLevels {
    /// 0-126 envelope units
    am: u16,
    /// -32..=32
    pm: i32,
}

#[derive(Debug, Clone, Default)]
struct OpnOperator {
    /// 20-bit phase accumulator
    phase: u32,
    envelope: Envelope,
}

#[derive(Debug, Clone, Default)]
struct OpnChannel {
    ops: [OpnOperator; 4],
    /// Operators currently keyed, bit 0 = operator 1
    key: u8,
    fnum: u16,
    block: u8,
    /// Block and F-number high bits waiting for the low byte
    fnum_latch: u8,
    algorithm: u8,
    feedback: u8,
    ams: u8,
    pms: u8,
    feedback_history: [i32; 2],
    last_amp: i32,
}

impl OpnChannel {
    fn set_key(&mut self, mask: u8) {
        for (index, op) in self.ops.iter_mut().enumerate() {
            let bit = 1 << index;
            let on = mask & bit != 0;
            if on == (self.key & bit != 0) {
                continue;
            }
            if on {
                op.phase = 0;
                op.envelope.key_on();
            } else {
                op.envelope.key_off();
            }
        }
        self.key = mask & 0x0F;
    }

    fn is_silent(&self) -> bool {
        self.ops.iter().all(|op| op.envelope.is_silent())
    }

    /// Step phases and envelopes one sample and mix the carriers
    fn clock(&mut self, regs: &[u8; 256], offset: usize, clock: EnvelopeClock, lfo: LfoLevels) -> i32 {
        let kc = key_code(self.fnum as u32, self.block);
        let fnum = if self.pms > 0 {
            let delta = self.fnum as i32 * PM_DEPTH[self.pms as usize] * lfo.pm / (1024 * 32);
            (self.fnum as i32 + delta).clamp(0, 0x7FF) as u32
        } else {
            self.fnum as u32
        };
        let am = AM_SHIFT[self.ams as usize].map_or(0, |shift| lfo.am >> shift);

        let mut attenuation = [MAX_ATTENUATION; 4];
        for (index, op) in self.ops.iter_mut().enumerate() {
            let reg = OP_REG_OFFSETS[index] + offset;
            let dt_mul = regs[0x30 + reg];
            let tl = (regs[0x40 + reg] & 0x7F) as u16;
            let ks_ar = regs[0x50 + reg];
            let am_dr = regs[0x60 + reg];
            let sr = regs[0x70 + reg] & 0x1F;
            let sl_rr = regs[0x80 + reg];

            // Phase: (fnum << block) >> 1, detuned, then multiplied
            let base = (fnum << self.block) >> 1;
            let detune = (dt_mul >> 4) & 0x07;
            let dt_delta = match detune & 0x03 {
                0 => 0,
                magnitude => DETUNE_TABLE[kc as usize][magnitude as usize] as u32,
            };
            let detuned = if detune & 0x04 != 0 {
                base.wrapping_sub(dt_delta)
            } else {
                base.wrapping_add(dt_delta)
            };
            let increment = match dt_mul & 0x0F {
                0 => detuned >> 1,
                multiple => detuned.wrapping_mul(multiple as u32),
            };
            op.phase = op.phase.wrapping_add(increment) & 0xF_FFFF;

            let rks = kc >> (3 - (ks_ar >> 6));
            let rates = EnvelopeRates {
                attack: effective_rate(ks_ar & 0x1F, rks),
                decay: effective_rate(am_dr & 0x1F, rks),
                sustain: effective_rate(sr, rks),
                release: effective_rate((sl_rr & 0x0F) << 1 | 1, rks),
                sustain_level: sustain_attenuation(sl_rr >> 4),
            };
            op.envelope.step(&rates, clock);

            let tremolo = if am_dr & 0x80 != 0 { am } else { 0 };
            attenuation[index] = (op.envelope.level() + (tl << 3) + tremolo).min(MAX_ATTENUATION);
        }

        let ops = &self.ops;
        let out = |index: usize, modulation: i32| -> i32 {
            let phase = ((ops[index].phase >> 10) as i32 + modulation) as u32;
            operator_output(phase, attenuation[index], false)
        };

        let feedback = match self.feedback {
            0 => 0,
            fb => (self.feedback_history[0] + self.feedback_history[1]) >> (10 - fb as i32),
        };
        let o1 = out(0, feedback);
        let mixed = match self.algorithm {
            0 => {
                let o2 = out(1, o1 >> 1);
                let o3 = out(2, o2 >> 1);
                out(3, o3 >> 1)
            }
            1 => {
                let o2 = out(1, 0);
                let o3 = out(2, (o1 + o2) >> 1);
                out(3, o3 >> 1)
            }
            2 => {
                let o2 = out(1, 0);
                let o3 = out(2, o2 >> 1);
                out(3, (o1 + o3) >> 1)
            }
            3 => {
                let o2 = out(1, o1 >> 1);
                let o3 = out(2, 0);
                out(3, (o2 + o3) >> 1)
            }
            4 => {
                let o3 = out(2, 0);
                out(1, o1 >> 1) + out(3, o3 >> 1)
            }
            5 => out(1, o1 >> 1) + out(2, o1 >> 1) + out(3, o1 >> 1),
            6 => out(1, o1 >> 1) + out(2, 0) + out(3, 0),
            _ => o1 + out(1, 0) + out(2, 0) + out(3, 0),
        };

        self.feedback_history = [o1, self.feedback_history[0]];
        clamp_amp(mixed)
    }
}

static WINDOWS: [AddressWindow; 1] = [AddressWindow::new(EPSM_ADDRESS_PORT_A, EPSM_DATA_PORT_B)];

/// YM2608: six 4-operator FM channels and a 3-voice SSG
pub struct Epsm {
    psg: Psg,
    /// Address latch per port
    latches: [u8; 2],
    regs: [[u8; 256]; 2],
    channels: [OpnChannel; EPSM_FM_CHANNELS],
    fm_outputs: [OutputTarget; EPSM_FM_CHANNELS],

    envelope_clock: EnvelopeClock,
    lfo_enabled: bool,
    lfo_rate: u8,
    lfo_counter: u8,
    lfo_divider: u16,

    next_sample: FixedCycle,
    last_time: Cycle,
    /// Rhythm/ADPCM writes have been reported once
    warned_unsupported: bool,

    ssg_synth: Synth,
    fm_synth: Synth,
}

impl Default for Epsm {
    fn default() -> Self {
        Self::new()
    }
}

impl Epsm {
    pub fn new() -> Self {
        let mut epsm = Self {
            psg: Psg::new(SSG_TICK, None),
            latches: [0; 2],
            regs: [[0; 256]; 2],
            channels: Default::default(),
            fm_outputs: [None; EPSM_FM_CHANNELS],
            envelope_clock: EnvelopeClock::default(),
            lfo_enabled: false,
            lfo_rate: 0,
            lfo_counter: 0,
            lfo_divider: 0,
            next_sample: FixedCycle::ZERO,
            last_time: 0,
            warned_unsupported: false,
            ssg_synth: Synth::new(0.25, PSG_AMP_RANGE),
            fm_synth: Synth::new(0.2, FM_AMP_RANGE),
        };
        epsm.reset();
        epsm
    }

    pub fn psg(&self) -> &Psg {
        &self.psg
    }

    /// Raw FM register bank of port 0 (A) or 1 (B)
    pub fn fm_regs(&self, port: usize) -> &[u8; 256] {
        &self.regs[port & 1]
    }

    /// Block and F-number in effect on an FM channel
    pub fn fm_frequency(&self, channel: usize) -> (u8, u16) {
        self.channels
            .get(channel)
            .map_or((0, 0), |ch| (ch.block, ch.fnum))
    }

    /// Keyed operators of an FM channel, bit 0 = operator 1
    pub fn key_mask(&self, channel: usize) -> u8 {
        self.channels.get(channel).map_or(0, |ch| ch.key)
    }

    /// Amplitude last sent for an FM channel
    pub fn fm_level(&self, channel: usize) -> i32 {
        self.channels.get(channel).map_or(0, |ch| ch.last_amp)
    }

    fn lfo_levels(&self) -> LfoLevels {
        if !self.lfo_enabled {
            return LfoLevels::default();
        }
        let counter = self.lfo_counter as i32;
        let am = if counter < 64 { counter * 2 } else { (127 - counter) * 2 };
        let pm = match counter {
            0..=31 => counter,
            32..=95 => 64 - counter,
            _ => counter - 128,
        };
        LfoLevels { am: am as u16, pm }
    }

    fn clock_lfo(&mut self) {
        if !self.lfo_enabled {
            return;
        }
        self.lfo_divider += 1;
        if self.lfo_divider >= LFO_DIVIDER_TABLE[self.lfo_rate as usize] {
            self.lfo_divider = 0;
            self.lfo_counter = (self.lfo_counter + 1) & 0x7F;
        }
    }

    fn clock_sample(&mut self, time: Cycle, sink: &mut dyn DeltaSink) {
        self.envelope_clock.tick();
        self.clock_lfo();
        let lfo = self.lfo_levels();
        for index in 0..EPSM_FM_CHANNELS {
            let (bank, offset) = (index / 3, index % 3);
            let regs = &self.regs[bank];
            let channel = &mut self.channels[index];
            let panned = regs[0xB4 + offset] & 0xC0 != 0;
            let amp = if channel.is_silent() {
                0
            } else {
                let amp = channel.clock(regs, offset, self.envelope_clock, lfo);
                if panned { amp } else { 0 }
            };
            self.fm_synth
                .offset(sink, self.fm_outputs[index], time, channel.last_amp, amp);
            channel.last_amp = amp;
        }
    }

    fn run_channels(&mut self, end_time: Cycle, sink: &mut dyn DeltaSink) {
        if end_time <= self.last_time {
            return;
        }
        self.psg.run(end_time, &self.ssg_synth, sink);
        let end = FixedCycle::from_cycles(end_time);
        while self.next_sample < end {
            self.clock_sample(self.next_sample.whole(), sink);
            self.next_sample += FM_SAMPLE_PERIOD;
        }
        self.last_time = end_time;
    }

    fn write_fm(&mut self, port: usize, reg: u8, value: u8) {
        self.regs[port][reg as usize] = value;
        let channel = |offset: u8| port * 3 + offset as usize;
        match (port, reg) {
            (0, 0x22) => {
                let enabled = value & 0x08 != 0;
                if !enabled {
                    self.lfo_counter = 0;
                    self.lfo_divider = 0;
                }
                if enabled != self.lfo_enabled {
                    debug!("epsm: lfo {}", if enabled { "on" } else { "off" });
                }
                self.lfo_enabled = enabled;
                self.lfo_rate = value & 0x07;
            }
            (0, 0x28) => {
                let index = match value & 0x07 {
                    code @ 0..=2 => code as usize,
                    code @ 4..=6 => code as usize - 1,
                    _ => return,
                };
                self.channels[index].set_key(value >> 4);
            }
            (_, 0xA0..=0xA2) => {
                let ch = &mut self.channels[channel(reg - 0xA0)];
                ch.block = (ch.fnum_latch >> 3) & 0x07;
                ch.fnum = ((ch.fnum_latch as u16 & 0x07) << 8) | value as u16;
            }
            (_, 0xA4..=0xA6) => {
                self.channels[channel(reg - 0xA4)].fnum_latch = value;
            }
            (_, 0xB0..=0xB2) => {
                let ch = &mut self.channels[channel(reg - 0xB0)];
                ch.algorithm = value & 0x07;
                ch.feedback = (value >> 3) & 0x07;
            }
            (_, 0xB4..=0xB6) => {
                let ch = &mut self.channels[channel(reg - 0xB4)];
                ch.ams = (value >> 4) & 0x03;
                ch.pms = value & 0x07;
            }
            _ => {}
        }
    }

    fn write_data(&mut self, time: Cycle, port: usize, value: u8, sink: &mut dyn DeltaSink) {
        let reg = self.latches[port];
        trace!("epsm: port {} reg {:02X} = {:02X} at {}", port, reg, value, time);
        match (port, reg) {
            (0, 0x00..=0x0F) => self.psg.write(time, reg, value, &self.ssg_synth, sink),
            (0, 0x10..=0x1F) => self.drop_unsupported("rhythm", reg),
            (1, 0x00..=0x2F) => self.drop_unsupported("adpcm", reg),
            _ => self.write_fm(port, reg, value),
        }
    }

    fn drop_unsupported(&mut self, unit: &str, reg: u8) {
        if self.warned_unsupported {
            debug!("epsm: {unit} register {reg:02X} ignored");
        } else {
            warn!("epsm: {unit} register {reg:02X} ignored, rhythm and adpcm are not emulated");
            self.warned_unsupported = true;
        }
    }
}

/// Replay position of a shadow slot: F-number high bytes go right before
/// their low byte, key registers last
fn replay_rank(slot: u16) -> (u16, u8) {
    match slot & 0xFF {
        _ if slot & KEY_ON_SLOT != 0 => (slot, 0),
        0xA4..=0xA6 => (slot - 4, 0),
        0xA0..=0xA2 => (slot, 1),
        _ => (slot, 0),
    }
}

impl SoundChip for Epsm {
    fn kind(&self) -> ChipKind {
        ChipKind::Epsm
    }

    fn windows(&self) -> &'static [AddressWindow] {
        &WINDOWS
    }

    fn osc_count(&self) -> usize {
        EPSM_OSC_COUNT
    }

    fn reset(&mut self) {
        self.psg.reset();
        self.latches = [0; 2];
        self.regs = [[0; 256]; 2];
        for bank in self.regs.iter_mut() {
            bank[0xB4..=0xB6].fill(0xC0);
        }
        for channel in self.channels.iter_mut() {
            *channel = OpnChannel::default();
        }
        self.envelope_clock = EnvelopeClock::default();
        self.lfo_enabled = false;
        self.lfo_rate = 0;
        self.lfo_counter = 0;
        self.lfo_divider = 0;
        self.next_sample = FixedCycle::ZERO;
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
            EPSM_ADDRESS_PORT_A => self.latches[0] = value,
            EPSM_ADDRESS_PORT_B => self.latches[1] = value,
            EPSM_DATA_PORT_A | EPSM_DATA_PORT_B => {
                ensure_monotonic(self.name(), time, self.last_time)?;
                self.run_channels(time, sink);
                let port = (addr == EPSM_DATA_PORT_B) as usize;
                self.write_data(time, port, value, sink);
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
        self.psg.end_frame(time, &self.ssg_synth, sink);
        self.next_sample = self.next_sample.saturating_sub(FixedCycle::from_cycles(time));
        self.last_time -= time;
        Ok(())
    }

    fn set_output(&mut self, osc: usize, target: OutputTarget) -> Result<()> {
        let valid = match osc.checked_sub(OSC_EPSM_FM1) {
            None => self.psg.set_output(osc, target),
            Some(fm) if fm < EPSM_FM_CHANNELS => {
                if self.fm_outputs[fm] != target {
                    self.channels[fm].last_amp = 0;
                }
                self.fm_outputs[fm] = target;
                true
            }
            Some(_) => false,
        };
        if valid {
            Ok(())
        } else {
            Err(ApuError::InvalidChannel {
                chip: self.name(),
                index: osc,
            })
        }
    }

    fn set_volume(&mut self, volume: f64) {
        self.ssg_synth.set_volume(volume);
        self.fm_synth.set_volume(volume);
    }

    fn set_treble_eq(&mut self, eq: TrebleEq) {
        self.ssg_synth.set_treble_eq(eq);
        self.fm_synth.set_treble_eq(eq);
    }

    /// Port B registers are kept apart from port A, and every channel code
    /// written to $28 gets its own slot
    fn capture_write(&self, addr: u16, value: u8, shadow: &mut ShadowRegisters) {
        match addr {
            EPSM_ADDRESS_PORT_A => shadow.set_latch(ChipKind::Epsm, 0, value),
            EPSM_ADDRESS_PORT_B => shadow.set_latch(ChipKind::Epsm, 1, value),
            EPSM_DATA_PORT_A | EPSM_DATA_PORT_B => {
                let port = (addr == EPSM_DATA_PORT_B) as u8;
                let reg = shadow
                    .latch(ChipKind::Epsm, port)
                    .unwrap_or(self.latches[port as usize]);
                let slot = match (port, reg) {
                    (0, 0x28) => KEY_ON_SLOT | (value & 0x07) as u16,
                    (0, _) => reg as u16,
                    _ => PORT_B_SLOT | reg as u16,
                };
                shadow.capture(ChipKind::Epsm, slot, value);
            }
            _ => {}
        }
    }

    fn replay_writes(&self, shadow: &ShadowRegisters) -> Vec<(u16, u8)> {
        let mut entries: Vec<(u16, u8)> = shadow.entries(ChipKind::Epsm).collect();
        entries.sort_by_key(|&(slot, _)| replay_rank(slot));

        let mut writes = Vec::with_capacity(entries.len() * 2 + 2);
        for (slot, value) in entries {
            let (reg, address_port, data_port) = if slot & KEY_ON_SLOT != 0 {
                (0x28, EPSM_ADDRESS_PORT_A, EPSM_DATA_PORT_A)
            } else if slot & PORT_B_SLOT != 0 {
                (slot as u8, EPSM_ADDRESS_PORT_B, EPSM_DATA_PORT_B)
            } else {
                (slot as u8, EPSM_ADDRESS_PORT_A, EPSM_DATA_PORT_A)
            };
            writes.push((address_port, reg));
            writes.push((data_port, value));
        }
        if let Some(latch) = shadow.latch(ChipKind::Epsm, 0) {
            writes.push((EPSM_ADDRESS_PORT_A, latch));
        }
        if let Some(latch) = shadow.latch(ChipKind::Epsm, 1) {
            writes.push((EPSM_ADDRESS_PORT_B, latch));
        }
        writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::{DeltaLog, NullSink};

    fn write(epsm: &mut Epsm, time: Cycle, port: usize, reg: u8, value: u8, sink: &mut dyn DeltaSink) {
        let (address, data) = if port == 0 {
            (EPSM_ADDRESS_PORT_A, EPSM_DATA_PORT_A)
        } else {
            (EPSM_ADDRESS_PORT_B, EPSM_DATA_PORT_B)
        };
        epsm.write_register(time, address, reg, sink).unwrap();
        epsm.write_register(time, data, value, sink).unwrap();
    }

    /// Channel 1 as a single sine carrier on operator 1
    fn sine_patch(epsm: &mut Epsm, sink: &mut dyn DeltaSink) {
        write(epsm, 0, 0, 0xB0, 0x07, sink); // algorithm 7, no feedback
        write(epsm, 0, 0, 0x30, 0x01, sink); // multiple 1
        write(epsm, 0, 0, 0x40, 0x00, sink);
        write(epsm, 0, 0, 0x50, 0x1F, sink); // fastest attack
        write(epsm, 0, 0, 0x80, 0x0F, sink); // sustain at peak, fastest release
        for reg in [0x48, 0x44, 0x4C] {
            write(epsm, 0, 0, reg, 0x7F, sink);
        }
        write(epsm, 0, 0, 0xA4, 0x22, sink);
        write(epsm, 0, 0, 0xA0, 0x69, sink);
    }

    #[test]
    fn test_ssg_registers_route_to_psg() {
        let mut epsm = Epsm::new();
        write(&mut epsm, 0, 0, 0x08, 0x0C, &mut NullSink);
        assert_eq!(epsm.psg().regs()[8], 0x0C);
        assert_eq!(epsm.fm_regs(0)[0x08], 0);
    }

    #[test]
    fn test_ssg_runs_at_master_clock() {
        let mut epsm = Epsm::new();
        epsm.set_output(0, Some(0)).unwrap();
        let mut log = DeltaLog::new();
        write(&mut epsm, 0, 0, 0x00, 0xFE, &mut log);
        write(&mut epsm, 0, 0, 0x07, 0b0011_1110, &mut log);
        write(&mut epsm, 0, 0, 0x08, 0x0F, &mut log);
        epsm.end_frame(29_780, &mut log).unwrap();
        // About 1818 CPU cycles per half period
        assert_eq!(log.len(), 16);
    }

    #[test]
    fn test_fnum_applies_on_low_byte() {
        let mut epsm = Epsm::new();
        write(&mut epsm, 0, 1, 0xA5, 0x22, &mut NullSink);
        assert_eq!(epsm.fm_frequency(4), (0, 0));
        write(&mut epsm, 0, 1, 0xA1, 0x55, &mut NullSink);
        assert_eq!(epsm.fm_frequency(4), (4, 0x255));
        write(&mut epsm, 0, 1, 0xA1, 0x10, &mut NullSink);
        assert_eq!(epsm.fm_frequency(4), (4, 0x210));
    }

    #[test]
    fn test_key_register_channel_codes() {
        let mut epsm = Epsm::new();
        write(&mut epsm, 0, 0, 0x28, 0xF5, &mut NullSink);
        assert_eq!(epsm.key_mask(4), 0x0F);
        write(&mut epsm, 0, 0, 0x28, 0x32, &mut NullSink);
        assert_eq!(epsm.key_mask(2), 0x03);
        write(&mut epsm, 0, 0, 0x28, 0xF3, &mut NullSink); // code 3 is unused
        assert!((0..EPSM_FM_CHANNELS).all(|ch| ch == 2 || ch == 4 || epsm.key_mask(ch) == 0));
    }

    #[test]
    fn test_fm_note_sounds_and_releases() {
        let mut epsm = Epsm::new();
        epsm.set_output(OSC_EPSM_FM1, Some(1)).unwrap();
        let mut log = DeltaLog::new();
        sine_patch(&mut epsm, &mut log);
        write(&mut epsm, 0, 0, 0x28, 0x10, &mut log);
        epsm.end_frame(29_780, &mut log).unwrap();
        assert!(log.len() > 100);
        assert!(log.deltas().iter().all(|d| d.target == 1));
        assert_ne!(epsm.fm_level(0), 0);

        write(&mut epsm, 0, 0, 0x28, 0x00, &mut log);
        epsm.end_frame(29_780, &mut log).unwrap();
        assert_eq!(epsm.fm_level(0), 0);
        assert_eq!(log.net(), 0);
    }

    #[test]
    fn test_rhythm_writes_are_dropped() {
        let mut epsm = Epsm::new();
        epsm.set_output(OSC_EPSM_FM1, Some(0)).unwrap();
        let mut log = DeltaLog::new();
        assert!(!epsm.warned_unsupported);
        for reg in 0x10..=0x1F {
            write(&mut epsm, 0, 0, reg, 0xFF, &mut log);
        }
        assert!(epsm.warned_unsupported);
        write(&mut epsm, 0, 1, 0x00, 0x01, &mut log);
        assert!(epsm.warned_unsupported);
        epsm.end_frame(1_000, &mut log).unwrap();
        assert!(log.is_empty());
        assert!(epsm.psg().regs().iter().enumerate().all(|(i, &v)| i == 7 || v == 0));
    }

    #[test]
    fn test_invalid_oscillator() {
        let mut epsm = Epsm::new();
        assert!(epsm.set_output(EPSM_OSC_COUNT - 1, Some(0)).is_ok());
        assert!(epsm.set_output(EPSM_OSC_COUNT, Some(0)).is_err());
    }

    #[test]
    fn test_rejects_time_going_backwards() {
        let mut epsm = Epsm::new();
        epsm.run_until(500, &mut NullSink).unwrap();
        assert!(epsm.write_register(10, EPSM_DATA_PORT_A, 0, &mut NullSink).is_err());
    }

    #[test]
    fn test_shadow_replay_restores_state() {
        let writes: [(usize, u8, u8); 10] = [
            (0, 0x07, 0x38),
            (0, 0xA4, 0x1A),
            (0, 0xA0, 0x40),
            (0, 0x28, 0xF0),
            (0, 0x28, 0x11),
            (0, 0x28, 0x00),
            (1, 0xA6, 0x2B),
            (1, 0xA2, 0x99),
            (1, 0xB6, 0x37),
            (0, 0x22, 0x0B),
        ];
        let mut live = Epsm::new();
        let mut seeking = Epsm::new();
        let mut shadow = ShadowRegisters::new();
        for &(port, reg, value) in &writes {
            write(&mut live, 0, port, reg, value, &mut NullSink);
            let (address, data) = if port == 0 {
                (EPSM_ADDRESS_PORT_A, EPSM_DATA_PORT_A)
            } else {
                (EPSM_ADDRESS_PORT_B, EPSM_DATA_PORT_B)
            };
            seeking.capture_write(address, reg, &mut shadow);
            seeking.capture_write(data, value, &mut shadow);
        }
        for (addr, value) in seeking.replay_writes(&shadow) {
            seeking.write_register(0, addr, value, &mut NullSink).unwrap();
        }
        assert_eq!(live.psg().regs(), seeking.psg().regs());
        assert_eq!(live.fm_regs(0)[0x22], seeking.fm_regs(0)[0x22]);
        for port in 0..2 {
            assert_eq!(live.fm_regs(port)[0x30..], seeking.fm_regs(port)[0x30..]);
        }
        for ch in 0..EPSM_FM_CHANNELS {
            assert_eq!(live.fm_frequency(ch), seeking.fm_frequency(ch));
            assert_eq!(live.key_mask(ch), seeking.key_mask(ch));
        }
        assert_eq!(live.key_mask(1), 0x01);
    }
}
