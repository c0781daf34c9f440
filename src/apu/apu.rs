use log::trace;
use serde::{Deserialize, Serialize};

use super::dmc::{Dmc, SampleMemory};
use super::frame_counter::FrameCounter;
use super::noise::Noise;
use super::pulse::Pulse;
use super::triangle::Triangle;
use crate::chip::{AddressWindow, ChipKind, SoundChip};
use crate::config::TvSystem;
use crate::error::{ensure_monotonic, ApuError, Result};
use crate::seek::ShadowRegisters;
use crate::synth::{Cycle, DeltaSink, OutputTarget, Synth, TrebleEq};

// Status register ($4015) bit masks
const STATUS_PULSE1: u8 = 1 << 0;
const STATUS_PULSE2: u8 = 1 << 1;
const STATUS_TRIANGLE: u8 = 1 << 2;
const STATUS_NOISE: u8 = 1 << 3;
const STATUS_DMC: u8 = 1 << 4;
const STATUS_FRAME_IRQ: u8 = 1 << 6;
const STATUS_DMC_IRQ: u8 = 1 << 7;

/// Oscillator indices for output routing
pub const OSC_PULSE1: usize = 0;
pub const OSC_PULSE2: usize = 1;
pub const OSC_TRIANGLE: usize = 2;
pub const OSC_NOISE: usize = 3;
pub const OSC_DMC: usize = 4;
pub const APU_OSC_COUNT: usize = 5;

static WINDOWS: [AddressWindow; 3] = [
    AddressWindow::new(0x4000, 0x4013),
    AddressWindow::single(0x4015),
    AddressWindow::single(0x4017),
];

/// Serializable state of the 2A03 sound hardware
///
/// Output assignments are not part of the state; restoring keeps the ones
/// already in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApuSnapshot {
    pub tv_system: TvSystem,
    pub frame_counter: FrameCounter,
    pub pulse1: Pulse,
    pub pulse2: Pulse,
    pub triangle: Triangle,
    pub noise: Noise,
    pub dmc: Dmc,
    pub osc_enables: u8,
    pub last_time: Cycle,
    pub last_dmc_time: Cycle,
}

/// The 2A03 sound hardware: two pulses, triangle, noise, DMC and the frame counter
pub struct Apu {
    tv_system: TvSystem,
    frame_counter: FrameCounter,
    pulse1: Pulse,
    pulse2: Pulse,
    triangle: Triangle,
    noise: Noise,
    dmc: Dmc,

    square_synth: Synth,
    triangle_synth: Synth,
    noise_synth: Synth,
    dmc_synth: Synth,

    /// Last value written to $4015
    osc_enables: u8,
    last_time: Cycle,
    last_dmc_time: Cycle,

    memory: Option<Box<dyn SampleMemory + Send>>,
}

impl Default for Apu {
    fn default() -> Self {
        Self::new(TvSystem::Ntsc)
    }
}

impl Apu {
    /// Create a new APU in its power-on state
    pub fn new(tv_system: TvSystem) -> Self {
        let pal = tv_system.is_pal();
        let mut apu = Self {
            tv_system,
            frame_counter: FrameCounter::new(tv_system),
            pulse1: Pulse::new(true), // Pulse 1 uses ones' complement
            pulse2: Pulse::new(false), // Pulse 2 uses two's complement
            triangle: Triangle::new(),
            noise: Noise::new(pal),
            dmc: Dmc::new(pal),
            square_synth: Synth::new(0.1128, 15),
            triangle_synth: Synth::new(0.12765, 15),
            noise_synth: Synth::new(0.0741, 15),
            dmc_synth: Synth::new(0.42545, 127),
            osc_enables: 0,
            last_time: 0,
            last_dmc_time: 0,
            memory: None,
        };
        apu.reset();
        apu
    }

    pub fn tv_system(&self) -> TvSystem {
        self.tv_system
    }

    /// Switch timing tables and reset
    pub fn set_tv_system(&mut self, tv_system: TvSystem) {
        self.tv_system = tv_system;
        self.frame_counter = FrameCounter::new(tv_system);
        self.noise.set_pal(tv_system.is_pal());
        self.dmc.set_pal(tv_system.is_pal());
        self.reset();
    }

    /// Attach the memory the DMC fetches samples from
    pub fn set_dmc_memory<M: SampleMemory + Send + 'static>(&mut self, memory: M) {
        self.memory = Some(Box::new(memory));
    }

    pub fn clear_dmc_memory(&mut self) {
        self.memory = None;
    }

    /// Get reference to pulse channel 1
    pub fn pulse1(&self) -> &Pulse {
        &self.pulse1
    }

    /// Get reference to pulse channel 2
    pub fn pulse2(&self) -> &Pulse {
        &self.pulse2
    }

    /// Get reference to triangle channel
    pub fn triangle(&self) -> &Triangle {
        &self.triangle
    }

    /// Get reference to noise channel
    pub fn noise(&self) -> &Noise {
        &self.noise
    }

    /// Get reference to DMC channel
    pub fn dmc(&self) -> &Dmc {
        &self.dmc
    }

    /// Get reference to frame counter
    pub fn frame_counter(&self) -> &FrameCounter {
        &self.frame_counter
    }

    /// Time the channels have been run to in the current frame
    pub fn last_time(&self) -> Cycle {
        self.last_time
    }

    /// Earliest time an IRQ is asserted: `Some(0)` while a flag is already
    /// raised, `None` when nothing is scheduled
    pub fn next_irq(&self) -> Option<Cycle> {
        if self.irq_pending() {
            return Some(0);
        }
        match (self.dmc.next_irq(), self.frame_counter.next_irq()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// DMC or frame IRQ flag raised
    pub fn irq_pending(&self) -> bool {
        self.dmc.get_irq_flag() || self.frame_counter.get_irq_flag()
    }

    fn run_channels(&mut self, end_time: Cycle, sink: &mut dyn DeltaSink) {
        if end_time <= self.last_time {
            return;
        }

        // The DMC does not depend on the frame counter
        if self.last_dmc_time < end_time {
            let start = self.last_dmc_time;
            self.last_dmc_time = end_time;
            let memory = self.memory.as_deref().map(|m| m as &dyn SampleMemory);
            self.dmc.run(start, end_time, memory, &self.dmc_synth, sink);
        }

        loop {
            // Earlier of the next frame counter edge or the end time
            let time = (self.last_time + self.frame_counter.delay()).min(end_time);
            self.frame_counter.elapse(time - self.last_time);

            self.pulse1.run(self.last_time, time, &self.square_synth, sink);
            self.pulse2.run(self.last_time, time, &self.square_synth, sink);
            self.triangle.run(self.last_time, time, &self.triangle_synth, sink);
            self.noise.run(self.last_time, time, &self.noise_synth, sink);
            self.last_time = time;

            if time == end_time {
                break;
            }

            let clocks = self.frame_counter.clock(time);
            // Half frame: clock length counters and sweep units
            if clocks.half {
                self.pulse1.clock_length_counter();
                self.pulse1.clock_sweep();
                self.pulse2.clock_length_counter();
                self.pulse2.clock_sweep();
                self.triangle.clock_length_counter();
                self.noise.clock_length_counter();
            }
            // Quarter frame: clock envelopes and linear counter
            if clocks.quarter {
                self.pulse1.clock_envelope();
                self.pulse2.clock_envelope();
                self.triangle.clock_linear_counter();
                self.noise.clock_envelope();
            }
        }
    }

    fn apply_write(&mut self, time: Cycle, addr: u16, value: u8) {
        match addr {
            0x4000..=0x4013 => {
                let osc = ((addr - 0x4000) >> 2) as usize;
                let reg = (addr & 3) as usize;
                let enabled = (self.osc_enables >> osc) & 1 != 0;
                match osc {
                    OSC_PULSE1 => self.pulse1.write_register(reg, value, enabled),
                    OSC_PULSE2 => self.pulse2.write_register(reg, value, enabled),
                    OSC_TRIANGLE => self.triangle.write_register(reg, value, enabled),
                    OSC_NOISE => self.noise.write_register(reg, value, enabled),
                    _ => self.dmc.write_register(reg, value, self.last_dmc_time),
                }
            }
            0x4015 => {
                self.pulse1.set_length_counter_enabled(value & STATUS_PULSE1 != 0);
                self.pulse2.set_length_counter_enabled(value & STATUS_PULSE2 != 0);
                self.triangle.set_length_counter_enabled(value & STATUS_TRIANGLE != 0);
                self.noise.set_length_counter_enabled(value & STATUS_NOISE != 0);
                self.dmc.clear_irq_flag();
                self.osc_enables = value;
                if value & STATUS_DMC == 0 {
                    self.dmc.stop();
                } else if !self.dmc.has_bytes_remaining() {
                    let memory = self.memory.as_deref().map(|m| m as &dyn SampleMemory);
                    self.dmc.start(memory, self.last_dmc_time);
                }
            }
            0x4017 => self.frame_counter.write_register(time, value),
            _ => {}
        }
    }

    /// Read the APU status register ($4015)
    /// Returns: IF-D NT21
    /// - Bit 7 (I): DMC interrupt flag
    /// - Bit 6 (F): Frame counter interrupt flag
    /// - Bit 4 (D): DMC active (bytes remaining > 0)
    /// - Bit 3 (N): Noise length counter > 0
    /// - Bit 2 (T): Triangle length counter > 0
    /// - Bit 1 (2): Pulse 2 length counter > 0
    /// - Bit 0 (1): Pulse 1 length counter > 0
    ///
    /// Side effect: Clears the frame counter interrupt flag
    pub fn read_status(&mut self, time: Cycle, sink: &mut dyn DeltaSink) -> Result<u8> {
        ensure_monotonic(self.name(), time, self.last_time)?;
        // Flags and counters as of the cycle before the read
        if time > self.last_time {
            self.run_channels(time - 1, sink);
        }

        let mut status = 0;
        if self.dmc.get_irq_flag() {
            status |= STATUS_DMC_IRQ;
        }
        if self.frame_counter.get_irq_flag() {
            status |= STATUS_FRAME_IRQ;
        }
        if self.pulse1.get_length_counter() > 0 {
            status |= STATUS_PULSE1;
        }
        if self.pulse2.get_length_counter() > 0 {
            status |= STATUS_PULSE2;
        }
        if self.triangle.get_length_counter() > 0 {
            status |= STATUS_TRIANGLE;
        }
        if self.noise.get_length_counter() > 0 {
            status |= STATUS_NOISE;
        }
        if self.dmc.has_bytes_remaining() {
            status |= STATUS_DMC;
        }

        self.run_channels(time, sink);
        if self.frame_counter.get_irq_flag() {
            status |= STATUS_FRAME_IRQ;
            self.frame_counter.clear_irq_flag();
        }
        Ok(status)
    }

    /// Capture the full hardware state
    pub fn snapshot(&self) -> ApuSnapshot {
        ApuSnapshot {
            tv_system: self.tv_system,
            frame_counter: self.frame_counter.clone(),
            pulse1: self.pulse1.clone(),
            pulse2: self.pulse2.clone(),
            triangle: self.triangle.clone(),
            noise: self.noise.clone(),
            dmc: self.dmc.clone(),
            osc_enables: self.osc_enables,
            last_time: self.last_time,
            last_dmc_time: self.last_dmc_time,
        }
    }

    /// Restore a captured state, keeping output assignments and the levels
    /// already sent to them
    pub fn restore(&mut self, snapshot: &ApuSnapshot) {
        self.tv_system = snapshot.tv_system;
        self.frame_counter = snapshot.frame_counter.clone();
        self.pulse1.restore(&snapshot.pulse1);
        self.pulse2.restore(&snapshot.pulse2);
        self.triangle.restore(&snapshot.triangle);
        self.noise.restore(&snapshot.noise);
        self.dmc.restore(&snapshot.dmc);
        self.osc_enables = snapshot.osc_enables;
        self.last_time = snapshot.last_time;
        self.last_dmc_time = snapshot.last_dmc_time;
    }
}

impl SoundChip for Apu {
    fn kind(&self) -> ChipKind {
        ChipKind::Apu
    }

    fn windows(&self) -> &'static [AddressWindow] {
        &WINDOWS
    }

    fn osc_count(&self) -> usize {
        APU_OSC_COUNT
    }

    fn reset(&mut self) {
        self.pulse1.reset();
        self.pulse2.reset();
        self.triangle.reset();
        self.noise.reset();
        self.dmc.reset();
        self.frame_counter.reset();
        self.last_time = 0;
        self.last_dmc_time = 0;
        self.osc_enables = 0;

        self.apply_write(0, 0x4017, 0x00);
        self.apply_write(0, 0x4015, 0x00);
        for addr in 0x4000..=0x4013u16 {
            self.apply_write(0, addr, if addr & 3 != 0 { 0x00 } else { 0x10 });
        }
        self.dmc.sync_last_amp();
    }

    fn write_register(
        &mut self,
        time: Cycle,
        addr: u16,
        value: u8,
        sink: &mut dyn DeltaSink,
    ) -> Result<()> {
        if !self.claims(addr) {
            return Ok(());
        }
        ensure_monotonic(self.name(), time, self.last_time)?;
        self.run_channels(time, sink);
        trace!("2a03: ${addr:04X} = {value:02X} at {time}");
        self.apply_write(time, addr, value);
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

        // Make times relative to the new frame
        self.last_time -= time;
        self.last_dmc_time -= time;
        self.frame_counter.end_frame(time);
        self.dmc.end_frame(time);
        Ok(())
    }

    fn set_output(&mut self, osc: usize, target: OutputTarget) -> Result<()> {
        match osc {
            OSC_PULSE1 => self.pulse1.set_output(target),
            OSC_PULSE2 => self.pulse2.set_output(target),
            OSC_TRIANGLE => self.triangle.set_output(target),
            OSC_NOISE => self.noise.set_output(target),
            OSC_DMC => self.dmc.set_output(target),
            _ => {
                return Err(ApuError::InvalidChannel {
                    chip: self.name(),
                    index: osc,
                });
            }
        }
        Ok(())
    }

    fn set_volume(&mut self, volume: f64) {
        self.square_synth.set_volume(volume);
        self.triangle_synth.set_volume(volume);
        self.noise_synth.set_volume(volume);
        self.dmc_synth.set_volume(volume);
    }

    fn set_treble_eq(&mut self, eq: TrebleEq) {
        self.square_synth.set_treble_eq(eq);
        self.triangle_synth.set_treble_eq(eq);
        self.noise_synth.set_treble_eq(eq);
        self.dmc_synth.set_treble_eq(eq);
    }

    /// DMC setup first so the enable write can start it, then channel enables
    /// so fourth-register writes reload the length counters, then the frame
    /// counter
    fn replay_writes(&self, shadow: &ShadowRegisters) -> Vec<(u16, u8)> {
        let order = (0x4010..=0x4013)
            .chain(std::iter::once(0x4015))
            .chain(0x4000..=0x400F)
            .chain(std::iter::once(0x4017));
        order
            .filter_map(|addr| shadow.get(ChipKind::Apu, addr).map(|value| (addr, value)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::{DeltaLog, NullSink};

    fn write_silently(apu: &mut Apu, time: Cycle, addr: u16, value: u8) -> Result<()> {
        apu.write_register(time, addr, value, &mut NullSink)
    }

    fn apu_with_outputs() -> Apu {
        let mut apu = Apu::new(TvSystem::Ntsc);
        for osc in 0..APU_OSC_COUNT {
            apu.set_output(osc, Some(0)).unwrap();
        }
        apu
    }

    fn ramp_memory(addr: u32) -> u8 {
        (addr >> 3) as u8
    }

    #[test]
    fn test_power_on_status_is_clear() {
        let mut apu = Apu::new(TvSystem::Ntsc);
        assert_eq!(apu.read_status(0, &mut NullSink).unwrap(), 0);
    }

    #[test]
    fn test_length_status_bits() {
        let mut apu = Apu::new(TvSystem::Ntsc);
        write_silently(&mut apu, 0, 0x4015, 0x0F).unwrap();
        write_silently(&mut apu, 0, 0x4003, 0x08).unwrap();
        write_silently(&mut apu, 0, 0x400B, 0x08).unwrap();
        let status = apu.read_status(10, &mut NullSink).unwrap();
        assert_eq!(status & 0x1F, STATUS_PULSE1 | STATUS_TRIANGLE);
    }

    #[test]
    fn test_length_not_loaded_while_disabled() {
        let mut apu = Apu::new(TvSystem::Ntsc);
        write_silently(&mut apu, 0, 0x4003, 0x08).unwrap();
        assert_eq!(apu.pulse1().get_length_counter(), 0);
    }

    #[test]
    fn test_disable_clears_length() {
        let mut apu = Apu::new(TvSystem::Ntsc);
        write_silently(&mut apu, 0, 0x4015, 0x08).unwrap();
        write_silently(&mut apu, 0, 0x400F, 0x08).unwrap();
        assert_eq!(apu.noise().get_length_counter(), 254);
        write_silently(&mut apu, 4, 0x4015, 0x00).unwrap();
        assert_eq!(apu.noise().get_length_counter(), 0);
    }

    #[test]
    fn test_unclaimed_addresses_ignored() {
        let mut apu = Apu::new(TvSystem::Ntsc);
        assert!(!apu.claims(0x4014));
        assert!(!apu.claims(0x4016));
        assert!(apu.claims(0x4017));
        write_silently(&mut apu, 0, 0x4016, 0xFF).unwrap();
        assert_eq!(apu.last_time(), 0);
    }

    #[test]
    fn test_frame_irq_raised_and_acknowledged() {
        let mut apu = Apu::new(TvSystem::Ntsc);
        assert_eq!(apu.read_status(29_000, &mut NullSink).unwrap() & STATUS_FRAME_IRQ, 0);
        assert_ne!(apu.read_status(29_900, &mut NullSink).unwrap() & STATUS_FRAME_IRQ, 0);
        // Reading acknowledged it
        assert_eq!(apu.read_status(29_901, &mut NullSink).unwrap() & STATUS_FRAME_IRQ, 0);
    }

    #[test]
    fn test_frame_irq_inhibited() {
        let mut apu = Apu::new(TvSystem::Ntsc);
        write_silently(&mut apu, 0, 0x4017, 0x40).unwrap();
        assert_eq!(apu.read_status(40_000, &mut NullSink).unwrap() & STATUS_FRAME_IRQ, 0);
        assert_eq!(apu.next_irq(), None);
    }

    #[test]
    fn test_next_irq_predicts_frame_irq() {
        let mut apu = Apu::new(TvSystem::Ntsc);
        let predicted = apu.next_irq();
        assert_eq!(predicted, Some(29_834));
        assert!(!apu.irq_pending());
        apu.run_until(29_832, &mut NullSink).unwrap();
        assert!(apu.irq_pending());
        assert_eq!(apu.next_irq(), Some(0));
    }

    #[test]
    fn test_dmc_irq_after_seventeen_bytes() {
        let mut apu = Apu::new(TvSystem::Ntsc);
        apu.set_dmc_memory(ramp_memory);
        write_silently(&mut apu, 0, 0x4017, 0x40).unwrap();
        write_silently(&mut apu, 0, 0x4010, 0x8F).unwrap(); // IRQ, fastest rate
        write_silently(&mut apu, 0, 0x4013, 0x01).unwrap(); // 17 bytes
        write_silently(&mut apu, 0, 0x4015, 0x10).unwrap();
        assert_ne!(apu.read_status(1, &mut NullSink).unwrap() & STATUS_DMC, 0);

        let mut raised = 0;
        let mut was_set = false;
        for t in (2..20_000).step_by(50) {
            let status = apu.read_status(t, &mut NullSink).unwrap();
            let set = status & STATUS_DMC_IRQ != 0;
            if set && !was_set {
                raised += 1;
            }
            was_set = set;
        }
        assert_eq!(raised, 1);
        let status = apu.read_status(20_000, &mut NullSink).unwrap();
        assert_eq!(status & STATUS_DMC, 0);
        // Writing $4015 acknowledges the DMC interrupt
        write_silently(&mut apu, 20_001, 0x4015, 0x00).unwrap();
        assert_eq!(apu.read_status(20_002, &mut NullSink).unwrap() & STATUS_DMC_IRQ, 0);
    }

    #[test]
    fn test_pulse_edges_through_registers() {
        let mut apu = apu_with_outputs();
        let mut log = DeltaLog::new();
        apu.write_register(0, 0x4015, 0x01, &mut log).unwrap();
        apu.write_register(0, 0x4000, 0xBF, &mut log).unwrap(); // 50%, halt, volume 15
        apu.write_register(0, 0x4002, 84, &mut log).unwrap();
        apu.write_register(0, 0x4003, 0x08, &mut log).unwrap();
        apu.run_until(10_000, &mut log).unwrap();
        let times = log.times();
        assert_eq!(times.len(), 10_679 / 680);
        assert!(times.windows(2).all(|w| w[1] - w[0] == 680));
    }

    #[test]
    fn test_silent_without_writes() {
        let mut apu = apu_with_outputs();
        let mut log = DeltaLog::new();
        apu.end_frame(29_780, &mut log).unwrap();
        apu.end_frame(29_780, &mut log).unwrap();
        assert!(log.is_empty());
    }

    #[test]
    fn test_run_until_is_idempotent() {
        let mut apu = apu_with_outputs();
        let mut log = DeltaLog::new();
        apu.write_register(0, 0x4015, 0x0F, &mut log).unwrap();
        apu.write_register(0, 0x400C, 0x3F, &mut log).unwrap();
        apu.write_register(0, 0x400F, 0x08, &mut log).unwrap();
        apu.run_until(5_000, &mut log).unwrap();
        let count = log.len();
        apu.run_until(5_000, &mut log).unwrap();
        assert_eq!(log.len(), count);
        apu.end_frame(5_000, &mut log).unwrap();
        apu.end_frame(0, &mut log).unwrap();
        assert_eq!(log.len(), count);
    }

    #[test]
    fn test_time_going_backwards_is_rejected() {
        let mut apu = Apu::new(TvSystem::Ntsc);
        apu.run_until(1_000, &mut NullSink).unwrap();
        let err = write_silently(&mut apu, 999, 0x4000, 0).unwrap_err();
        assert!(matches!(err, ApuError::TimeWentBackwards { time: 999, .. }));
    }

    #[test]
    fn test_end_frame_rebases_time() {
        let mut apu = Apu::new(TvSystem::Ntsc);
        apu.end_frame(10_000, &mut NullSink).unwrap();
        assert_eq!(apu.last_time(), 0);
        assert!(write_silently(&mut apu, 0, 0x4000, 0).is_ok());
        // The frame IRQ keeps its absolute position across frames
        assert_eq!(apu.next_irq(), Some(29_834 - 10_000));
    }

    #[test]
    fn test_muted_channel_keeps_running() {
        let mut apu = Apu::new(TvSystem::Ntsc);
        let mut log = DeltaLog::new();
        apu.write_register(0, 0x4015, 0x01, &mut log).unwrap();
        apu.write_register(0, 0x4000, 0x1F, &mut log).unwrap(); // no halt
        apu.write_register(0, 0x4003, 0x18, &mut log).unwrap(); // length 2
        apu.run_until(30_000, &mut log).unwrap();
        assert!(log.is_empty());
        // Two half frames elapsed: the length counter expired
        assert_eq!(apu.pulse1().get_length_counter(), 0);
    }

    #[test]
    fn test_envelope_gets_clocked() {
        let mut apu = Apu::new(TvSystem::Ntsc);
        write_silently(&mut apu, 0, 0x4003, 0xFF).unwrap();
        write_silently(&mut apu, 0, 0x4007, 0xFF).unwrap();
        assert!(apu.pulse1().get_envelope_start_flag());
        assert!(apu.pulse2().get_envelope_start_flag());

        // First quarter frame
        apu.run_until(7_460, &mut NullSink).unwrap();
        assert!(!apu.pulse1().get_envelope_start_flag());
        assert!(!apu.pulse2().get_envelope_start_flag());
    }

    #[test]
    fn test_length_and_sweep_get_clocked() {
        let mut apu = Apu::new(TvSystem::Ntsc);
        write_silently(&mut apu, 0, 0x4015, 0x01).unwrap();
        write_silently(&mut apu, 0, 0x4000, 0x00).unwrap(); // halt=0
        write_silently(&mut apu, 0, 0x4001, 0x81).unwrap();
        write_silently(&mut apu, 0, 0x4003, 0b0001_0000).unwrap(); // index 2 = length 20
        assert!(apu.pulse1().get_sweep_reload());

        // Quarter frame only
        apu.run_until(7_460, &mut NullSink).unwrap();
        assert_eq!(apu.pulse1().get_length_counter(), 20);

        // First half frame
        apu.run_until(14_916, &mut NullSink).unwrap();
        assert_eq!(apu.pulse1().get_length_counter(), 19);
        assert!(!apu.pulse1().get_sweep_reload());
    }

    #[test]
    fn test_five_step_write_clocks_immediately() {
        let mut apu = Apu::new(TvSystem::Ntsc);
        write_silently(&mut apu, 0, 0x4015, 0x01).unwrap();
        write_silently(&mut apu, 0, 0x4003, 0b0001_0000).unwrap();
        write_silently(&mut apu, 100, 0x4017, 0x80).unwrap();
        apu.run_until(110, &mut NullSink).unwrap();
        assert_eq!(apu.pulse1().get_length_counter(), 19);
        assert!(apu.frame_counter().get_mode());
    }

    #[test]
    fn test_invalid_oscillator() {
        let mut apu = Apu::new(TvSystem::Ntsc);
        assert!(matches!(
            apu.set_output(5, Some(0)),
            Err(ApuError::InvalidChannel { index: 5, .. })
        ));
    }

    #[test]
    fn test_snapshot_round_trip_through_json() {
        let mut apu = apu_with_outputs();
        let mut log = DeltaLog::new();
        apu.write_register(0, 0x4015, 0x0F, &mut log).unwrap();
        apu.write_register(0, 0x4000, 0xBF, &mut log).unwrap();
        apu.write_register(0, 0x4002, 0x40, &mut log).unwrap();
        apu.write_register(0, 0x4003, 0x09, &mut log).unwrap();
        apu.run_until(3_333, &mut log).unwrap();

        let json = serde_json::to_string(&apu.snapshot()).unwrap();
        let snapshot: ApuSnapshot = serde_json::from_str(&json).unwrap();

        let mut restored = apu_with_outputs();
        restored.restore(&snapshot);
        assert_eq!(restored.pulse1().period(), 0x140);
        assert_eq!(restored.pulse1().sequence_position(), apu.pulse1().sequence_position());
        assert_eq!(restored.pulse1().output(), Some(0));
        assert_eq!(restored.last_time(), 3_333);

        let mut a = DeltaLog::new();
        let mut b = DeltaLog::new();
        apu.run_until(9_000, &mut a).unwrap();
        restored.run_until(9_000, &mut b).unwrap();
        // After the level catch-up step both produce the same edges
        assert_eq!(a.times(), b.times()[b.len() - a.len()..].to_vec());
    }

    #[test]
    fn test_replay_order() {
        let mut shadow = ShadowRegisters::new();
        let apu = Apu::new(TvSystem::Ntsc);
        for (addr, value) in [(0x4017, 0x40), (0x4003, 0x08), (0x4015, 0x1F), (0x4012, 0x10)] {
            apu.capture_write(addr, value, &mut shadow);
        }
        let order: Vec<u16> = apu.replay_writes(&shadow).iter().map(|&(a, _)| a).collect();
        assert_eq!(order, vec![0x4012, 0x4015, 0x4003, 0x4017]);
    }
}
