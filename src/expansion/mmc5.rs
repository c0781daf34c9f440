use log::{debug, trace};

use crate::apu::{FrameCounter, Pulse};
use crate::chip::{AddressWindow, ChipKind, SoundChip};
use crate::error::{ensure_monotonic, ApuError, Result};
use crate::seek::ShadowRegisters;
use crate::synth::{Cycle, DeltaSink, OutputTarget, Synth, TrebleEq};

pub const MMC5_OSC_COUNT: usize = 3;
pub const OSC_MMC5_PULSE1: usize = 0;
pub const OSC_MMC5_PULSE2: usize = 1;
pub const OSC_MMC5_PCM: usize = 2;

static WINDOWS: [AddressWindow; 1] = [AddressWindow::new(0x5000, 0x5015)];

/// MMC5 audio: two 2A03-style pulses without sweep, and an 8-bit PCM DAC
///
/// The pulses' envelopes and length counters run from the mapper's own
/// sequencer, which clocks everything at a fixed 240 Hz.
pub struct Mmc5 {
    frame_counter: FrameCounter,
    pulse1: Pulse,
    pulse2: Pulse,

    /// $5010 bit 0: PCM is fed by CPU reads instead of $5011 writes
    pcm_read_mode: bool,
    pcm_level: u8,
    pcm_last_amp: i32,
    pcm_output: OutputTarget,

    /// Last value written to $5015
    osc_enables: u8,
    last_time: Cycle,

    square_synth: Synth,
    pcm_synth: Synth,
}

impl Default for Mmc5 {
    fn default() -> Self {
        Self::new()
    }
}

impl Mmc5 {
    pub fn new() -> Self {
        Self {
            frame_counter: FrameCounter::new_mmc5(),
            pulse1: Pulse::without_sweep(),
            pulse2: Pulse::without_sweep(),
            pcm_read_mode: false,
            pcm_level: 0,
            pcm_last_amp: 0,
            pcm_output: None,
            osc_enables: 0,
            last_time: 0,
            square_synth: Synth::new(0.1128, 15),
            pcm_synth: Synth::new(0.42545, 255),
        }
    }

    pub fn pulse1(&self) -> &Pulse {
        &self.pulse1
    }

    pub fn pulse2(&self) -> &Pulse {
        &self.pulse2
    }

    pub fn pcm_level(&self) -> u8 {
        self.pcm_level
    }

    /// $5015 read: length counter status of both pulses
    pub fn read_status(&self) -> u8 {
        let mut status = 0;
        if self.pulse1.get_length_counter() > 0 {
            status |= 0x01;
        }
        if self.pulse2.get_length_counter() > 0 {
            status |= 0x02;
        }
        status
    }

    fn run_channels(&mut self, end_time: Cycle, sink: &mut dyn DeltaSink) {
        if end_time <= self.last_time {
            return;
        }
        loop {
            let time = (self.last_time + self.frame_counter.delay()).min(end_time);
            self.frame_counter.elapse(time - self.last_time);

            self.pulse1.run(self.last_time, time, &self.square_synth, sink);
            self.pulse2.run(self.last_time, time, &self.square_synth, sink);
            self.last_time = time;

            if time == end_time {
                break;
            }

            // Every edge of the fixed-rate sequencer is both a quarter and a half frame
            let clocks = self.frame_counter.clock(time);
            if clocks.half {
                self.pulse1.clock_length_counter();
                self.pulse2.clock_length_counter();
            }
            if clocks.quarter {
                self.pulse1.clock_envelope();
                self.pulse2.clock_envelope();
            }
        }
    }

    fn update_pcm(&mut self, time: Cycle, sink: &mut dyn DeltaSink) {
        let amp = self.pcm_level as i32;
        self.pcm_synth
            .offset(sink, self.pcm_output, time, self.pcm_last_amp, amp);
        self.pcm_last_amp = amp;
    }
}

impl SoundChip for Mmc5 {
    fn kind(&self) -> ChipKind {
        ChipKind::Mmc5
    }

    fn windows(&self) -> &'static [AddressWindow] {
        &WINDOWS
    }

    fn osc_count(&self) -> usize {
        MMC5_OSC_COUNT
    }

    fn reset(&mut self) {
        self.frame_counter.reset();
        self.pulse1.reset();
        self.pulse2.reset();
        self.pcm_read_mode = false;
        self.pcm_level = 0;
        self.osc_enables = 0;
        self.last_time = 0;
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
        trace!("mmc5: {:04X} = {:02X} at {}", addr, value, time);

        match addr {
            0x5000..=0x5003 => {
                let enabled = self.osc_enables & 0x01 != 0;
                self.pulse1.write_register((addr & 3) as usize, value, enabled);
            }
            0x5004..=0x5007 => {
                let enabled = self.osc_enables & 0x02 != 0;
                self.pulse2.write_register((addr & 3) as usize, value, enabled);
            }
            0x5010 => {
                let read_mode = value & 0x01 != 0;
                if read_mode != self.pcm_read_mode {
                    debug!("mmc5: pcm {} mode", if read_mode { "read" } else { "write" });
                }
                self.pcm_read_mode = read_mode;
            }
            0x5011 => {
                // Zero is ignored in write mode
                if !self.pcm_read_mode && value != 0 {
                    self.pcm_level = value;
                    self.update_pcm(time, sink);
                }
            }
            0x5015 => {
                self.osc_enables = value;
                self.pulse1.set_length_counter_enabled(value & 0x01 != 0);
                self.pulse2.set_length_counter_enabled(value & 0x02 != 0);
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
        self.last_time -= time;
        Ok(())
    }

    fn set_output(&mut self, osc: usize, target: OutputTarget) -> Result<()> {
        match osc {
            OSC_MMC5_PULSE1 => self.pulse1.set_output(target),
            OSC_MMC5_PULSE2 => self.pulse2.set_output(target),
            OSC_MMC5_PCM => {
                if target != self.pcm_output {
                    self.pcm_last_amp = 0;
                }
                self.pcm_output = target;
            }
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
        self.pcm_synth.set_volume(volume);
    }

    fn set_treble_eq(&mut self, eq: TrebleEq) {
        self.square_synth.set_treble_eq(eq);
        self.pcm_synth.set_treble_eq(eq);
    }

    /// Enables go first so length loads on the fourth registers take effect
    fn replay_writes(&self, shadow: &ShadowRegisters) -> Vec<(u16, u8)> {
        let order = std::iter::once(0x5015).chain(0x5000..=0x5011);
        order
            .filter_map(|addr| shadow.get(ChipKind::Mmc5, addr).map(|value| (addr, value)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apu::MMC5_FRAME_PERIOD;
    use crate::synth::{DeltaLog, NullSink};

    fn write(mmc5: &mut Mmc5, time: Cycle, addr: u16, value: u8, sink: &mut dyn DeltaSink) {
        mmc5.write_register(time, addr, value, sink).unwrap();
    }

    #[test]
    fn test_length_counter_runs_at_fixed_rate() {
        let mut mmc5 = Mmc5::new();
        write(&mut mmc5, 0, 0x5015, 0x01, &mut NullSink);
        write(&mut mmc5, 0, 0x5000, 0x1F, &mut NullSink); // no halt, constant volume
        write(&mut mmc5, 0, 0x5003, 0x08, &mut NullSink); // length 254
        assert_eq!(mmc5.read_status(), 0x01);
        mmc5.end_frame(MMC5_FRAME_PERIOD * 4, &mut NullSink).unwrap();
        // Edges at 1, 2, 3 periods; the 4th lands on the frame end and waits
        assert_eq!(mmc5.pulse1().get_length_counter(), 251);
    }

    #[test]
    fn test_no_sweep_silencing_at_low_period() {
        let mut mmc5 = Mmc5::new();
        mmc5.set_output(OSC_MMC5_PULSE1, Some(0)).unwrap();
        let mut log = DeltaLog::new();
        write(&mut mmc5, 0, 0x5015, 0x01, &mut log);
        write(&mut mmc5, 0, 0x5000, 0xBF, &mut log); // duty 50%, halt, volume 15
        write(&mut mmc5, 0, 0x5002, 0x04, &mut log); // period 4, silent on the 2A03
        write(&mut mmc5, 0, 0x5003, 0x08, &mut log);
        mmc5.end_frame(1_000, &mut log).unwrap();
        assert!(!log.is_empty());
    }

    #[test]
    fn test_pcm_raw_writes() {
        let mut mmc5 = Mmc5::new();
        mmc5.set_output(OSC_MMC5_PCM, Some(0)).unwrap();
        let mut log = DeltaLog::new();
        write(&mut mmc5, 10, 0x5011, 0x80, &mut log);
        write(&mut mmc5, 20, 0x5011, 0x00, &mut log); // ignored
        assert_eq!(mmc5.pcm_level(), 0x80);
        write(&mut mmc5, 30, 0x5010, 0x01, &mut log);
        write(&mut mmc5, 40, 0x5011, 0x20, &mut log); // read mode ignores writes
        assert_eq!(mmc5.pcm_level(), 0x80);
        assert_eq!(log.times(), vec![10]);
    }

    #[test]
    fn test_disable_clears_length() {
        let mut mmc5 = Mmc5::new();
        write(&mut mmc5, 0, 0x5015, 0x03, &mut NullSink);
        write(&mut mmc5, 0, 0x5007, 0x08, &mut NullSink);
        assert_eq!(mmc5.read_status(), 0x02);
        write(&mut mmc5, 4, 0x5015, 0x00, &mut NullSink);
        assert_eq!(mmc5.read_status(), 0);
    }

    #[test]
    fn test_replay_enables_before_length_loads() {
        let mut mmc5 = Mmc5::new();
        let mut shadow = ShadowRegisters::new();
        mmc5.capture_write(0x5003, 0x08, &mut shadow);
        mmc5.capture_write(0x5015, 0x01, &mut shadow);
        let writes = mmc5.replay_writes(&shadow);
        assert_eq!(writes, vec![(0x5015, 0x01), (0x5003, 0x08)]);
        for (addr, value) in writes {
            write(&mut mmc5, 0, addr, value, &mut NullSink);
        }
        assert_eq!(mmc5.pulse1().get_length_counter(), 254);
    }
}
