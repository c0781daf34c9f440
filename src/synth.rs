//! Boundary between the oscillators and the band-limited accumulation buffers
//!
//! Oscillators never write absolute levels. Every change in amplitude is
//! reported as a delta at the exact CPU cycle it happens, scaled by the
//! owning chip's [`Synth`] and routed to the buffer the channel is assigned to.

use std::ops::{Add, AddAssign, Sub};

use blip_buf::BlipBuf;
use serde::{Deserialize, Serialize};

/// CPU clock time, relative to the start of the current frame
pub type Cycle = u32;

/// Index of the accumulation buffer a channel feeds; `None` mutes the channel
/// while it keeps running
pub type OutputTarget = Option<usize>;

/// Peak amplitude of a full-scale buffer sample
const FULL_SCALE: f64 = 32767.0;

/// Band-limited buffer that turns amplitude deltas into PCM
pub trait AccumulationBuffer {
    /// Add an amplitude step at `time`
    fn add_delta(&mut self, time: Cycle, delta: i32);

    /// Close the frame at `time`; deltas after this are relative to the new frame
    fn end_frame(&mut self, time: Cycle);

    /// Number of samples ready to be read
    fn samples_avail(&self) -> usize;

    /// Drain up to `out.len()` samples, returning how many were written
    fn read_samples(&mut self, out: &mut [i16]) -> usize;

    /// Drop buffered samples and pending deltas
    fn clear(&mut self);
}

impl AccumulationBuffer for BlipBuf {
    fn add_delta(&mut self, time: Cycle, delta: i32) {
        BlipBuf::add_delta(self, time, delta);
    }

    fn end_frame(&mut self, time: Cycle) {
        BlipBuf::end_frame(self, time);
    }

    fn samples_avail(&self) -> usize {
        BlipBuf::samples_avail(self) as usize
    }

    fn read_samples(&mut self, out: &mut [i16]) -> usize {
        BlipBuf::read_samples(self, out, false)
    }

    fn clear(&mut self) {
        BlipBuf::clear(self);
    }
}

/// Create a blip buffer for a CPU clock rate and output sample rate
pub fn new_blip_buffer(clock_rate: f64, sample_rate: u32, samples: u32) -> BlipBuf {
    let mut buffer = BlipBuf::new(samples);
    buffer.set_rates(clock_rate, sample_rate as f64);
    buffer
}

/// A single recorded amplitude step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delta {
    /// Absolute time since the log was created or cleared
    pub time: u64,
    pub target: usize,
    pub delta: i32,
}

/// Accumulation buffer that records deltas instead of synthesizing samples
///
/// Useful for analysis tools (waveform views, register-to-edge tracing) and
/// for checking emission schedules.
#[derive(Debug, Default, Clone)]
pub struct DeltaLog {
    frame_start: u64,
    deltas: Vec<Delta>,
}

impl DeltaLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deltas(&self) -> &[Delta] {
        &self.deltas
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Sum of all recorded deltas, i.e. the current level relative to silence
    pub fn net(&self) -> i64 {
        self.deltas.iter().map(|d| d.delta as i64).sum()
    }

    /// Absolute times of every recorded delta
    pub fn times(&self) -> Vec<u64> {
        self.deltas.iter().map(|d| d.time).collect()
    }

    fn record(&mut self, target: usize, time: Cycle, delta: i32) {
        self.deltas.push(Delta {
            time: self.frame_start + time as u64,
            target,
            delta,
        });
    }
}

impl AccumulationBuffer for DeltaLog {
    fn add_delta(&mut self, time: Cycle, delta: i32) {
        self.record(0, time, delta);
    }

    fn end_frame(&mut self, time: Cycle) {
        self.frame_start += time as u64;
    }

    fn samples_avail(&self) -> usize {
        0
    }

    fn read_samples(&mut self, _out: &mut [i16]) -> usize {
        0
    }

    fn clear(&mut self) {
        self.deltas.clear();
        self.frame_start = 0;
    }
}

/// Destination for oscillator output, addressed by buffer index
pub trait DeltaSink {
    fn add_delta(&mut self, target: usize, time: Cycle, delta: i32);
}

impl<B: AccumulationBuffer> DeltaSink for [B] {
    fn add_delta(&mut self, target: usize, time: Cycle, delta: i32) {
        if let Some(buffer) = self.get_mut(target) {
            buffer.add_delta(time, delta);
        }
    }
}

impl<B: AccumulationBuffer> DeltaSink for Vec<B> {
    fn add_delta(&mut self, target: usize, time: Cycle, delta: i32) {
        self.as_mut_slice().add_delta(target, time, delta);
    }
}

/// A lone log records every target
impl DeltaSink for DeltaLog {
    fn add_delta(&mut self, target: usize, time: Cycle, delta: i32) {
        self.record(target, time, delta);
    }
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DeltaSink for NullSink {
    fn add_delta(&mut self, _target: usize, _time: Cycle, _delta: i32) {}
}

/// Treble equalization requested for a chip's output
///
/// The value is kept with the chip so hosts can read it back and apply it in
/// their buffer layer; `blip_buf` itself uses a fixed kernel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrebleEq {
    /// Attenuation at half the sample rate, in dB (negative values roll off)
    pub treble_db: f64,
    /// Frequency where the roll-off starts
    pub rolloff_hz: u32,
}

impl Default for TrebleEq {
    fn default() -> Self {
        Self {
            treble_db: 0.0,
            rolloff_hz: 0,
        }
    }
}

/// Converts chip amplitude units into buffer units
///
/// Conversion is applied to absolute levels and differenced, so any run of
/// steps that returns to a level returns the buffer to the same level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Synth {
    level: f64,
    amp_range: i32,
    volume: f64,
    treble: TrebleEq,
    /// 16.16 fixed-point multiplier
    gain: i64,
}

impl Synth {
    /// `level` is the fraction of full scale reached at amplitude `amp_range`
    pub fn new(level: f64, amp_range: i32) -> Self {
        let mut synth = Self {
            level,
            amp_range: amp_range.max(1),
            volume: 1.0,
            treble: TrebleEq::default(),
            gain: 0,
        };
        synth.update_gain();
        synth
    }

    fn update_gain(&mut self) {
        let unit = self.level * self.volume * FULL_SCALE / self.amp_range as f64;
        self.gain = (unit * 65536.0).round() as i64;
    }

    pub fn set_volume(&mut self, volume: f64) {
        self.volume = volume;
        self.update_gain();
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn set_treble_eq(&mut self, eq: TrebleEq) {
        self.treble = eq;
    }

    pub fn treble_eq(&self) -> TrebleEq {
        self.treble
    }

    /// Buffer level for a chip amplitude
    pub fn scale(&self, amp: i32) -> i32 {
        ((amp as i64 * self.gain) >> 16) as i32
    }

    /// Emit the step from amplitude `from` to `to` at `time`
    #[inline]
    pub fn offset(
        &self,
        sink: &mut dyn DeltaSink,
        target: OutputTarget,
        time: Cycle,
        from: i32,
        to: i32,
    ) {
        if let Some(index) = target {
            let delta = self.scale(to) - self.scale(from);
            if delta != 0 {
                sink.add_delta(index, time, delta);
            }
        }
    }
}

/// CPU-cycle time in 16.16 fixed point, for chips whose internal clock is
/// not an integer divisor of the CPU clock
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash, Serialize, Deserialize,
)]
pub struct FixedCycle(u64);

impl FixedCycle {
    pub const FRAC_BITS: u32 = 16;
    pub const ZERO: FixedCycle = FixedCycle(0);

    pub const fn from_cycles(cycles: Cycle) -> Self {
        FixedCycle((cycles as u64) << Self::FRAC_BITS)
    }

    /// `num / den` cycles, truncated to the fixed-point resolution
    pub const fn from_ratio(num: u64, den: u64) -> Self {
        FixedCycle((num << Self::FRAC_BITS) / den)
    }

    pub const fn from_raw(raw: u64) -> Self {
        FixedCycle(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whole cycles, truncated
    pub const fn whole(self) -> Cycle {
        (self.0 >> Self::FRAC_BITS) as Cycle
    }

    pub const fn saturating_sub(self, other: FixedCycle) -> FixedCycle {
        FixedCycle(self.0.saturating_sub(other.0))
    }

    pub const fn mul(self, factor: u64) -> FixedCycle {
        FixedCycle(self.0 * factor)
    }
}

impl Add for FixedCycle {
    type Output = FixedCycle;

    fn add(self, rhs: FixedCycle) -> FixedCycle {
        FixedCycle(self.0 + rhs.0)
    }
}

impl AddAssign for FixedCycle {
    fn add_assign(&mut self, rhs: FixedCycle) {
        self.0 += rhs.0;
    }
}

impl Sub for FixedCycle {
    type Output = FixedCycle;

    fn sub(self, rhs: FixedCycle) -> FixedCycle {
        FixedCycle(self.0 - rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synth_steps_return_to_zero() {
        let synth = Synth::new(0.1128, 15);
        let mut log = DeltaLog::new();
        let levels = [0, 5, 15, 7, 3, 0];
        for (i, pair) in levels.windows(2).enumerate() {
            synth.offset(&mut log, Some(0), i as Cycle, pair[0], pair[1]);
        }
        assert_eq!(log.net(), 0);
    }

    #[test]
    fn test_synth_muted_target_emits_nothing() {
        let synth = Synth::new(1.0, 15);
        let mut log = DeltaLog::new();
        synth.offset(&mut log, None, 0, 0, 15);
        assert!(log.is_empty());
    }

    #[test]
    fn test_synth_volume_scales_output() {
        let mut synth = Synth::new(1.0, 1);
        let full = synth.scale(1);
        synth.set_volume(0.5);
        assert_eq!(synth.scale(1), full / 2);
        assert_eq!(synth.volume(), 0.5);
    }

    #[test]
    fn test_synth_keeps_treble_eq() {
        let mut synth = Synth::new(1.0, 15);
        let eq = TrebleEq {
            treble_db: -8.0,
            rolloff_hz: 8800,
        };
        synth.set_treble_eq(eq);
        assert_eq!(synth.treble_eq(), eq);
    }

    #[test]
    fn test_delta_log_tracks_frames() {
        let mut log = DeltaLog::new();
        AccumulationBuffer::add_delta(&mut log, 10, 1);
        AccumulationBuffer::end_frame(&mut log, 100);
        AccumulationBuffer::add_delta(&mut log, 10, -1);
        assert_eq!(log.times(), vec![10, 110]);
        assert_eq!(log.net(), 0);
    }

    #[test]
    fn test_buffer_slice_routes_by_target() {
        let mut buffers = vec![DeltaLog::new(), DeltaLog::new()];
        DeltaSink::add_delta(&mut buffers, 1, 5, 3);
        DeltaSink::add_delta(&mut buffers, 7, 5, 3); // no such buffer
        assert!(buffers[0].is_empty());
        assert_eq!(buffers[1].len(), 1);
    }

    #[test]
    fn test_blip_buffer_produces_samples() {
        let mut buffer = new_blip_buffer(1_789_773.0, 44_100, 4410);
        AccumulationBuffer::add_delta(&mut buffer, 0, 1000);
        AccumulationBuffer::end_frame(&mut buffer, 29_780);
        let avail = AccumulationBuffer::samples_avail(&buffer);
        assert!(avail > 700);
        let mut out = vec![0i16; avail];
        assert_eq!(AccumulationBuffer::read_samples(&mut buffer, &mut out), avail);
        assert!(out.iter().any(|&s| s != 0));
    }

    #[test]
    fn test_fixed_cycle_arithmetic() {
        let period = FixedCycle::from_ratio(3, 2);
        let mut t = FixedCycle::ZERO;
        t += period;
        t += period;
        assert_eq!(t.whole(), 3);
        assert_eq!((t - period).whole(), 1);
        assert_eq!(FixedCycle::from_cycles(7).raw(), 7 << 16);
        assert_eq!(period.mul(4).whole(), 6);
    }
}
