//! Register-level facade over the 2A03 and every expansion chip
//!
//! The host sees one address space. Writes are dispatched to whichever active
//! chips decode the address, times are kept on a shared CPU clock and each
//! frame ends on every chip and buffer together.

use blip_buf::BlipBuf;
use log::{debug, info, trace, warn};

use crate::apu::{Apu, ApuSnapshot, SampleMemory};
use crate::chip::{ChipKind, SoundChip};
use crate::config::{ApuConfig, Expansions};
use crate::error::{ApuError, Result};
use crate::expansion::{Epsm, Fds, Mmc5, Namco163, Sunsoft5b, Vrc6, Vrc7};
use crate::seek::{SeekState, ShadowRegisters};
use crate::synth::{new_blip_buffer, AccumulationBuffer, Cycle, OutputTarget, TrebleEq};

/// CPU cycles the implicit clock advances per register access
pub const CYCLES_PER_ACCESS: Cycle = 4;

const MMC5_STATUS: u16 = 0x5015;
const N163_DATA: u16 = 0x4800;

/// One instance of every chip, active or not
struct Chips {
    apu: Apu,
    vrc6: Vrc6,
    vrc7: Vrc7,
    fds: Fds,
    mmc5: Mmc5,
    n163: Namco163,
    s5b: Sunsoft5b,
    epsm: Epsm,
}

impl Chips {
    fn new(config: &ApuConfig) -> Self {
        Self {
            apu: Apu::new(config.tv_system),
            vrc6: Vrc6::new(),
            vrc7: Vrc7::new(),
            fds: Fds::new(),
            mmc5: Mmc5::new(),
            n163: Namco163::new(),
            s5b: Sunsoft5b::new(),
            epsm: Epsm::new(),
        }
    }

    fn get(&self, kind: ChipKind) -> &dyn SoundChip {
        match kind {
            ChipKind::Apu => &self.apu,
            ChipKind::Vrc6 => &self.vrc6,
            ChipKind::Vrc7 => &self.vrc7,
            ChipKind::Fds => &self.fds,
            ChipKind::Mmc5 => &self.mmc5,
            ChipKind::N163 => &self.n163,
            ChipKind::S5B => &self.s5b,
            ChipKind::Epsm => &self.epsm,
        }
    }

    fn get_mut(&mut self, kind: ChipKind) -> &mut dyn SoundChip {
        match kind {
            ChipKind::Apu => &mut self.apu,
            ChipKind::Vrc6 => &mut self.vrc6,
            ChipKind::Vrc7 => &mut self.vrc7,
            ChipKind::Fds => &mut self.fds,
            ChipKind::Mmc5 => &mut self.mmc5,
            ChipKind::N163 => &mut self.n163,
            ChipKind::S5B => &mut self.s5b,
            ChipKind::Epsm => &mut self.epsm,
        }
    }
}

/// NES sound hardware as seen from the CPU bus
///
/// Every oscillator starts out routed to buffer 0.
pub struct NesSound<B: AccumulationBuffer = BlipBuf> {
    chips: Chips,
    buffers: Vec<B>,
    config: ApuConfig,
    expansions: Expansions,
    /// Implicit CPU time of the next access
    clock: Cycle,
    seek_state: SeekState,
    shadow: ShadowRegisters,
}

impl NesSound<BlipBuf> {
    /// Build the chips and `config.buffer_count` blip buffers
    pub fn new(config: ApuConfig) -> Result<Self> {
        config.validate()?;
        let buffers = (0..config.buffer_count)
            .map(|_| {
                new_blip_buffer(
                    config.tv_system.cpu_clock(),
                    config.sample_rate,
                    config.buffer_samples(),
                )
            })
            .collect();
        Self::with_buffers(config, buffers)
    }
}

impl<B: AccumulationBuffer> NesSound<B> {
    /// Build the chips around caller-provided buffers; `buffer_count` follows `buffers`
    pub fn with_buffers(mut config: ApuConfig, buffers: Vec<B>) -> Result<Self> {
        config.buffer_count = buffers.len();
        config.validate()?;

        let mut sound = Self {
            chips: Chips::new(&config),
            buffers,
            expansions: config.expansions,
            config,
            clock: 0,
            seek_state: SeekState::Normal,
            shadow: ShadowRegisters::new(),
        };
        for kind in ChipKind::ALL {
            let chip = sound.chips.get_mut(kind);
            for osc in 0..chip.osc_count() {
                chip.set_output(osc, Some(0))?;
            }
        }
        sound.preset_n163_voices();
        info!(
            "sound system ready: {:?}, {} Hz, {} buffer(s), expansions {:?}",
            sound.config.tv_system,
            sound.config.sample_rate,
            sound.buffers.len(),
            sound.expansions
        );
        Ok(sound)
    }

    /// Seed the N163 voice count from the configuration after a power-on
    fn preset_n163_voices(&mut self) {
        if let Some(channels) = self.config.n163_channels {
            self.chips.n163.set_active_voices(channels as usize);
        }
    }

    pub fn config(&self) -> &ApuConfig {
        &self.config
    }

    pub fn expansions(&self) -> Expansions {
        self.expansions
    }

    /// Change the active expansions; chips that become active start from power-on
    pub fn set_expansions(&mut self, expansions: Expansions) {
        let enabled = expansions - self.expansions;
        for kind in ChipKind::ALL {
            if kind.expansion().is_some_and(|bit| enabled.contains(bit)) {
                self.chips.get_mut(kind).reset();
            }
        }
        if enabled.contains(Expansions::N163) {
            self.preset_n163_voices();
        }
        info!("expansions {:?} -> {:?}", self.expansions, expansions);
        self.expansions = expansions;
        self.config.expansions = expansions;
    }

    /// Power-on every chip, drop buffered audio and leave seek mode
    pub fn reset(&mut self) {
        for kind in ChipKind::ALL {
            self.chips.get_mut(kind).reset();
        }
        self.preset_n163_voices();
        for buffer in self.buffers.iter_mut() {
            buffer.clear();
        }
        self.clock = 0;
        self.seek_state = SeekState::Normal;
        self.shadow.clear();
        info!("sound system reset");
    }

    /// Implicit CPU time of the next access
    pub fn clock(&self) -> Cycle {
        self.clock
    }

    fn active_chips(&self) -> impl Iterator<Item = ChipKind> + use<B> {
        let expansions = self.expansions;
        ChipKind::ALL
            .into_iter()
            .filter(move |kind| kind.is_active(expansions))
    }

    /// Write at the implicit clock, then advance it by one access
    pub fn write_register(&mut self, addr: u16, value: u8) -> Result<()> {
        let time = self.clock;
        let result = self.write_register_at(time, addr, value);
        if self.seek_state == SeekState::Normal {
            self.clock = time + CYCLES_PER_ACCESS;
        }
        result
    }

    /// Write at an explicit CPU time
    ///
    /// Every active chip decoding `addr` receives the write. A chip that
    /// rejects it does not stop delivery to the others; the first error is
    /// returned. Addresses nobody decodes are ignored.
    pub fn write_register_at(&mut self, time: Cycle, addr: u16, value: u8) -> Result<()> {
        if self.seek_state == SeekState::Seeking {
            for kind in self.active_chips() {
                self.chips
                    .get(kind)
                    .capture_write(addr, value, &mut self.shadow);
            }
            return Ok(());
        }

        let mut result = Ok(());
        for kind in self.active_chips() {
            let chip = self.chips.get_mut(kind);
            if !chip.claims(addr) {
                continue;
            }
            if let Err(err) = chip.write_register(time, addr, value, &mut self.buffers) {
                warn!("{} rejected ${addr:04X}={value:02X}: {err}", kind.name());
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        self.clock = self.clock.max(time);
        result
    }

    /// Read $4015, acknowledging the frame IRQ
    pub fn read_status(&mut self, time: Cycle) -> Result<u8> {
        if self.seek_state == SeekState::Seeking {
            return Err(ApuError::SeekInProgress("read_status"));
        }
        let status = self.chips.apu.read_status(time, &mut self.buffers)?;
        self.clock = self.clock.max(time);
        Ok(status)
    }

    /// Read a readable sound register: $4015, MMC5 $5015 or N163 $4800
    ///
    /// Returns `None` for addresses no active chip can read back.
    pub fn read_register(&mut self, time: Cycle, addr: u16) -> Result<Option<u8>> {
        match addr {
            0x4015 => self.read_status(time).map(Some),
            MMC5_STATUS if ChipKind::Mmc5.is_active(self.expansions) => {
                Ok(Some(self.chips.mmc5.read_status()))
            }
            N163_DATA if ChipKind::N163.is_active(self.expansions) => {
                Ok(Some(self.chips.n163.read_data()))
            }
            _ => Ok(None),
        }
    }

    /// Cycle of the next APU IRQ, if one is scheduled
    pub fn next_irq(&self) -> Option<Cycle> {
        self.chips.apu.next_irq()
    }

    pub fn irq_pending(&self) -> bool {
        self.chips.apu.irq_pending()
    }

    /// Run every active chip to `frame_length`, close the buffers and rebase the clock
    ///
    /// A chip failing to finish the frame is logged and skipped; the rest of
    /// the frame still completes. Returns the samples now available in buffer 0.
    pub fn end_frame(&mut self, frame_length: Cycle) -> Result<usize> {
        if self.seek_state == SeekState::Seeking {
            trace!("end_frame ignored while seeking");
            return Ok(0);
        }
        if self.clock > frame_length {
            return Err(ApuError::FrameOverrun {
                clock: self.clock,
                frame_length,
            });
        }

        for kind in self.active_chips() {
            if let Err(err) = self
                .chips
                .get_mut(kind)
                .end_frame(frame_length, &mut self.buffers)
            {
                warn!("{} could not end frame: {err}", kind.name());
            }
        }
        for buffer in self.buffers.iter_mut() {
            buffer.end_frame(frame_length);
        }
        self.clock = self.clock.saturating_sub(frame_length);
        Ok(self.samples_avail())
    }

    pub fn samples_avail(&self) -> usize {
        self.buffers.first().map_or(0, |b| b.samples_avail())
    }

    /// Drain samples from one buffer; a missing buffer yields nothing
    pub fn read_samples(&mut self, buffer: usize, out: &mut [i16]) -> usize {
        self.buffers
            .get_mut(buffer)
            .map_or(0, |b| b.read_samples(out))
    }

    pub fn buffer(&self, index: usize) -> Option<&B> {
        self.buffers.get(index)
    }

    pub fn buffer_mut(&mut self, index: usize) -> Option<&mut B> {
        self.buffers.get_mut(index)
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Route one oscillator of a chip to a buffer, or mute it with `None`
    pub fn set_output_target(
        &mut self,
        kind: ChipKind,
        osc: usize,
        target: OutputTarget,
    ) -> Result<()> {
        if let Some(index) = target {
            if index >= self.buffers.len() {
                return Err(ApuError::InvalidBuffer {
                    index,
                    count: self.buffers.len(),
                });
            }
        }
        self.chips.get_mut(kind).set_output(osc, target)
    }

    pub fn set_volume(&mut self, kind: ChipKind, volume: f64) {
        self.chips.get_mut(kind).set_volume(volume);
    }

    pub fn set_treble_eq(&mut self, kind: ChipKind, eq: TrebleEq) {
        self.chips.get_mut(kind).set_treble_eq(eq);
    }

    pub fn set_dmc_memory<M: SampleMemory + Send + 'static>(&mut self, memory: M) {
        self.chips.apu.set_dmc_memory(memory);
    }

    pub fn clear_dmc_memory(&mut self) {
        self.chips.apu.clear_dmc_memory();
    }

    pub fn snapshot(&self) -> ApuSnapshot {
        self.chips.apu.snapshot()
    }

    pub fn restore(&mut self, snapshot: &ApuSnapshot) -> Result<()> {
        if self.seek_state == SeekState::Seeking {
            return Err(ApuError::SeekInProgress("restore"));
        }
        self.chips.apu.restore(snapshot);
        self.clock = self.clock.max(snapshot.last_time);
        Ok(())
    }

    pub fn is_seeking(&self) -> bool {
        self.seek_state == SeekState::Seeking
    }

    pub fn seek_state(&self) -> SeekState {
        self.seek_state
    }

    /// Start capturing writes instead of applying them
    pub fn start_seeking(&mut self) -> Result<()> {
        if self.seek_state == SeekState::Seeking {
            return Err(ApuError::SeekInProgress("start_seeking"));
        }
        self.shadow.clear();
        self.seek_state = SeekState::Seeking;
        debug!("seek started at cycle {}", self.clock);
        Ok(())
    }

    /// Apply the captured registers as real writes, one cycle apart
    ///
    /// Each active chip replays in the order it reports. A rejected write is
    /// logged and the replay carries on; the first error is returned.
    pub fn stop_seeking(&mut self) -> Result<()> {
        if self.seek_state != SeekState::Seeking {
            return Err(ApuError::NotSeeking);
        }
        self.seek_state = SeekState::Normal;

        let mut time = self.clock;
        let mut result = Ok(());
        let mut replayed = 0usize;
        for kind in self.active_chips() {
            let writes = self.chips.get(kind).replay_writes(&self.shadow);
            let chip = self.chips.get_mut(kind);
            for (addr, value) in writes {
                if let Err(err) = chip.write_register(time, addr, value, &mut self.buffers) {
                    warn!("{} replay of ${addr:04X}={value:02X} failed: {err}", kind.name());
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
                time += 1;
                replayed += 1;
            }
        }
        self.clock = self.clock.max(time);
        self.shadow.clear();
        debug!("seek finished, {replayed} writes replayed");
        result
    }

    pub fn apu(&self) -> &Apu {
        &self.chips.apu
    }

    pub fn vrc6(&self) -> &Vrc6 {
        &self.chips.vrc6
    }

    pub fn vrc7(&self) -> &Vrc7 {
        &self.chips.vrc7
    }

    pub fn fds(&self) -> &Fds {
        &self.chips.fds
    }

    /// FDS tempo scaling of its envelope clock
    pub fn set_fds_tempo(&mut self, tempo: f64) {
        self.chips.fds.set_tempo(tempo);
    }

    pub fn mmc5(&self) -> &Mmc5 {
        &self.chips.mmc5
    }

    pub fn n163(&self) -> &Namco163 {
        &self.chips.n163
    }

    pub fn s5b(&self) -> &Sunsoft5b {
        &self.chips.s5b
    }

    pub fn epsm(&self) -> &Epsm {
        &self.chips.epsm
    }

    pub fn chip(&self, kind: ChipKind) -> &dyn SoundChip {
        self.chips.get(kind)
    }
}
