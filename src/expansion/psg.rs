//! AY-3-8910 style programmable sound generator shared by the Sunsoft 5B and
//! the SSG half of the EPSM
//!
//! Registers:
//! - 0-5:  tone periods, 12 bits per voice (fine, coarse)
//! - 6:    noise period, 5 bits
//! - 7:    mixer, bits 0-2 tone off, bits 3-5 noise off
//! - 8-10: ---E VVVV  envelope select, fixed volume
//! - 11-12: envelope period (fine, coarse)
//! - 13:   envelope shape, writing restarts the envelope

use serde::{Deserialize, Serialize};

use crate::synth::{Cycle, DeltaSink, FixedCycle, OutputTarget, Synth};

pub const PSG_VOICES: usize = 3;

/// Output level per 5-bit volume step, about 1.5 dB apart
pub const VOLUME_TABLE: [u8; 32] = [
    0, 1, 1, 1, 2, 2, 3, 3, 4, 4, 5, 6, 7, 8, 10, 12, 14, 17, 20, 24, 29, 34, 41, 48, 57, 68, 81,
    96, 114, 136, 162, 192,
];

/// Loudest entry of [`VOLUME_TABLE`]
pub const PSG_AMP_RANGE: i32 = 192;

/// Tone toggles every 16 ticks per period unit
const TONE_FACTOR: u64 = 16;
/// Noise shifts every 32 ticks per period unit
const NOISE_FACTOR: u64 = 32;
/// One of the 32 envelope steps every 16 ticks per period unit
const ENVELOPE_FACTOR: u64 = 16;

const ENVELOPE_STEPS: u8 = 32;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ToneVoice {
    high: bool,
    next: FixedCycle,
    last_amp: i32,
}

/// Three square voices, a noise generator and an envelope generator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Psg {
    regs: [u8; 16],
    /// CPU time of one tick of the chip clock
    tick: FixedCycle,
    /// Tone half-periods shorter than this many cycles mute the voice
    mute_below: Option<Cycle>,

    voices: [ToneVoice; PSG_VOICES],

    noise_lfsr: u32,
    noise_next: FixedCycle,

    envelope_step: u8,
    envelope_attack: bool,
    envelope_hold: Option<u8>,
    envelope_next: FixedCycle,

    last_time: Cycle,

    #[serde(skip)]
    outputs: [OutputTarget; PSG_VOICES],
}

impl Psg {
    pub fn new(tick: FixedCycle, mute_below: Option<Cycle>) -> Self {
        let mut psg = Self {
            regs: [0; 16],
            tick,
            mute_below,
            voices: Default::default(),
            noise_lfsr: 1,
            noise_next: FixedCycle::ZERO,
            envelope_step: 0,
            envelope_attack: false,
            envelope_hold: None,
            envelope_next: FixedCycle::ZERO,
            last_time: 0,
            outputs: [None; PSG_VOICES],
        };
        psg.reset();
        psg
    }

    /// Power-on state: every voice silent, mixer fully off
    pub fn reset(&mut self) {
        self.regs = [0; 16];
        self.regs[7] = 0xFF;
        self.noise_lfsr = 1;
        self.last_time = 0;
        for voice in 0..PSG_VOICES {
            self.voices[voice].high = false;
            self.voices[voice].next = self.tone_period(voice);
        }
        self.noise_next = self.noise_period();
        self.restart_envelope(FixedCycle::ZERO);
    }

    pub fn regs(&self) -> &[u8; 16] {
        &self.regs
    }

    pub fn last_time(&self) -> Cycle {
        self.last_time
    }

    pub fn noise_lfsr(&self) -> u32 {
        self.noise_lfsr
    }

    pub fn set_output(&mut self, voice: usize, target: OutputTarget) -> bool {
        match self.outputs.get_mut(voice) {
            Some(slot) => {
                if *slot != target {
                    self.voices[voice].last_amp = 0;
                }
                *slot = target;
                true
            }
            None => false,
        }
    }

    fn tone_period_units(&self, voice: usize) -> u64 {
        let period = ((self.regs[voice * 2 + 1] & 0x0F) as u64) << 8 | self.regs[voice * 2] as u64;
        period.max(1)
    }

    fn tone_period(&self, voice: usize) -> FixedCycle {
        self.tick.mul(self.tone_period_units(voice) * TONE_FACTOR)
    }

    fn noise_period(&self) -> FixedCycle {
        let period = (self.regs[6] & 0x1F).max(1) as u64;
        self.tick.mul(period * NOISE_FACTOR)
    }

    fn envelope_period(&self) -> FixedCycle {
        let period = ((self.regs[12] as u64) << 8 | self.regs[11] as u64).max(1);
        self.tick.mul(period * ENVELOPE_FACTOR)
    }

    fn restart_envelope(&mut self, now: FixedCycle) {
        self.envelope_step = 0;
        self.envelope_attack = self.regs[13] & 0x04 != 0;
        self.envelope_hold = None;
        self.envelope_next = now + self.envelope_period();
    }

    /// Current envelope level, 0-31
    pub fn envelope_level(&self) -> u8 {
        match self.envelope_hold {
            Some(level) => level,
            None if self.envelope_attack => self.envelope_step,
            None => ENVELOPE_STEPS - 1 - self.envelope_step,
        }
    }

    fn clock_envelope(&mut self) {
        if self.envelope_hold.is_some() {
            return;
        }
        self.envelope_step += 1;
        if self.envelope_step < ENVELOPE_STEPS {
            return;
        }
        let shape = self.regs[13];
        let attack = shape & 0x04 != 0;
        let alternate = shape & 0x02 != 0;
        if shape & 0x08 == 0 {
            // Shapes 0-7 decay or ramp once, then stay silent
            self.envelope_hold = Some(0);
        } else if shape & 0x01 != 0 {
            let top = attack != alternate;
            self.envelope_hold = Some(if top { ENVELOPE_STEPS - 1 } else { 0 });
        } else {
            self.envelope_step = 0;
            if alternate {
                self.envelope_attack = !self.envelope_attack;
            }
        }
    }

    /// 17-bit LFSR, output is bit 0
    fn clock_noise(&mut self) {
        let feedback = if self.noise_lfsr & 1 != 0 { 0x12000 } else { 0 };
        self.noise_lfsr = (self.noise_lfsr >> 1) ^ feedback;
    }

    fn volume(&self, voice: usize) -> i32 {
        let control = self.regs[8 + voice];
        let index = if control & 0x10 != 0 {
            self.envelope_level() as usize
        } else {
            match control & 0x0F {
                0 => 0,
                v => v as usize * 2 + 1,
            }
        };
        VOLUME_TABLE[index] as i32
    }

    /// Applies whatever the mixer selects, noise-only voices included
    fn is_pop_muted(&self, voice: usize) -> bool {
        self.mute_below
            .is_some_and(|limit| self.tone_period(voice) < FixedCycle::from_cycles(limit))
    }

    fn amp(&self, voice: usize) -> i32 {
        if self.is_pop_muted(voice) {
            return 0;
        }
        let mixer = self.regs[7];
        let tone = self.voices[voice].high || mixer & (1 << voice) != 0;
        let noise = self.noise_lfsr & 1 != 0 || mixer & (8 << voice) != 0;
        if tone && noise { self.volume(voice) } else { 0 }
    }

    fn update_outputs(&mut self, time: Cycle, synth: &Synth, sink: &mut dyn DeltaSink) {
        for voice in 0..PSG_VOICES {
            let amp = self.amp(voice);
            let last = self.voices[voice].last_amp;
            if amp != last {
                synth.offset(sink, self.outputs[voice], time, last, amp);
                self.voices[voice].last_amp = amp;
            }
        }
    }

    /// Run every generator up to `end`
    pub fn run(&mut self, end: Cycle, synth: &Synth, sink: &mut dyn DeltaSink) {
        if end <= self.last_time {
            return;
        }
        let end_time = FixedCycle::from_cycles(end);
        self.update_outputs(self.last_time, synth, sink);
        loop {
            let next = self
                .voices
                .iter()
                .map(|v| v.next)
                .chain([self.noise_next, self.envelope_next])
                .min()
                .unwrap_or(end_time);
            if next >= end_time {
                break;
            }
            for voice in 0..PSG_VOICES {
                if self.voices[voice].next == next {
                    self.voices[voice].high = !self.voices[voice].high;
                    self.voices[voice].next = next + self.tone_period(voice);
                }
            }
            if self.noise_next == next {
                self.clock_noise();
                self.noise_next = next + self.noise_period();
            }
            if self.envelope_next == next {
                self.clock_envelope();
                self.envelope_next = next + self.envelope_period();
            }
            self.update_outputs(next.whole(), synth, sink);
        }
        self.last_time = end;
    }

    /// Run to `time`, then write register `reg`
    pub fn write(&mut self, time: Cycle, reg: u8, value: u8, synth: &Synth, sink: &mut dyn DeltaSink) {
        self.run(time, synth, sink);
        let reg = (reg & 0x0F) as usize;
        let now = FixedCycle::from_cycles(time);
        match reg {
            0..=5 => {
                let voice = reg / 2;
                let old = self.tone_period(voice);
                self.regs[reg] = value;
                let new = self.tone_period(voice);
                // Keep the time already served on the running half-period
                let next = self.voices[voice].next;
                self.voices[voice].next = if new >= old {
                    next + (new - old)
                } else {
                    next.saturating_sub(old - new).max(now)
                };
            }
            13 => {
                self.regs[reg] = value & 0x0F;
                self.restart_envelope(now);
            }
            14 | 15 => {
                // I/O ports, no sound
                self.regs[reg] = value;
            }
            _ => self.regs[reg] = value,
        }
        self.update_outputs(time, synth, sink);
    }

    /// Run to `end` and make it the new time zero
    pub fn end_frame(&mut self, end: Cycle, synth: &Synth, sink: &mut dyn DeltaSink) {
        self.run(end, synth, sink);
        let shift = FixedCycle::from_cycles(end);
        for voice in self.voices.iter_mut() {
            voice.next = voice.next.saturating_sub(shift);
        }
        self.noise_next = self.noise_next.saturating_sub(shift);
        self.envelope_next = self.envelope_next.saturating_sub(shift);
        self.last_time -= end;
    }
}
