pub mod channel;
pub mod tag;

use crate::bus::{Bus128, SPR_FLAG};
use crate::error::DmaError;
use crate::fifo::{PeerFifo, QwFifo, Sif, WordFifo};
use channel::{CHANNEL_COUNT, Channel, ChannelMode, ChannelRegister, Port};
use proc_bitfield::bitfield;

crate::define_addr!(D_CTRL_ADDR, 0x1000_E000, 0, 4, 0x10);
crate::define_addr!(D_STAT_ADDR, 0x1000_E000, 1, 4, 0x10);
crate::define_addr!(D_PCR_ADDR, 0x1000_E000, 2, 4, 0x10);
crate::define_addr!(D_SQWC_ADDR, 0x1000_E000, 3, 4, 0x10);
crate::define_addr!(D_RBSR_ADDR, 0x1000_E000, 4, 4, 0x10);
crate::define_addr!(D_RBOR_ADDR, 0x1000_E000, 5, 4, 0x10);
crate::define_addr!(D_STADR_ADDR, 0x1000_E000, 6, 4, 0x10);
crate::define_addr!(D_ENABLER_ADDR, 0x1000_F520, 0, 4, 0x10);
crate::define_addr!(D_ENABLEW_ADDR, 0x1000_F590, 0, 4, 0x10);

/// D_ENABLEW bit 16 suspends every channel at once.
const ENABLE_SUSPEND: u32 = 1 << 16;

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct DmaControl(pub u32): Debug, FromStorage, IntoStorage, DerefStorage {
        pub enable: bool @ 0,
        pub cycle_stealing: bool @ 1,
        pub memory_fifo: u8 @ 2..=3,
        pub stall_source: u8 @ 4..=5,
        pub stall_drain: u8 @ 6..=7,
        pub release_cycle: u8 @ 8..=10,
    }
}

bitfield! {
    /// D_STAT. The low half is write-1-to-clear; writes XOR into the
    /// mask half, so setting an already-set mask bit clears it.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct DmaStatus(pub u32): Debug, FromStorage, IntoStorage, DerefStorage {
        pub channel_pending: u16 @ 0..=9,
        pub bus_error: bool @ 15,
        pub channel_mask: u16 @ 16..=25,
    }
}

bitfield! {
    /// D_PCR. Only the cross-processor readiness query consumes this;
    /// scheduling stays strict lowest-index-first.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct PriorityControl(pub u32): Debug, FromStorage, IntoStorage, DerefStorage {
        pub cond: u16 @ 0..=9,
        pub enable: u16 @ 16..=25,
        pub control_enable: bool @ 31,
    }
}

/// FIFOs of the primary engine's exclusive peers. The bridge FIFOs live
/// in [`Sif`] because the secondary engine shares them.
pub struct EePeers {
    pub vif0: QwFifo,
    pub vif1: QwFifo,
    pub gif: QwFifo,
    pub from_ipu: QwFifo,
    pub to_ipu: QwFifo,
}

impl EePeers {
    pub fn new() -> Self {
        Self {
            vif0: QwFifo::vif(),
            vif1: QwFifo::vif(),
            gif: QwFifo::gif(),
            from_ipu: QwFifo::ipu(),
            to_ipu: QwFifo::ipu(),
        }
    }
}

impl Default for EePeers {
    fn default() -> Self {
        Self::new()
    }
}

fn push_qw(fifo: &mut QwFifo, value: u128, channel: usize, name: &'static str) -> Result<(), DmaError> {
    fifo.push(value).map_err(|_| DmaError::FifoOverflow { channel, fifo: name })
}

fn pop_qw(fifo: &mut QwFifo, channel: usize, name: &'static str) -> Result<u128, DmaError> {
    fifo.pop().ok_or(DmaError::FifoUnderflow { channel, fifo: name })
}

fn pop_word(fifo: &mut WordFifo, channel: usize, name: &'static str) -> Result<u32, DmaError> {
    fifo.pop().ok_or(DmaError::FifoUnderflow { channel, fifo: name })
}

fn pop_bridge_qw(fifo: &mut WordFifo, channel: usize, name: &'static str) -> Result<u128, DmaError> {
    let mut value = 0u128;
    for slot in 0..4 {
        value |= (pop_word(fifo, channel, name)? as u128) << (32 * slot);
    }
    Ok(value)
}

fn push_bridge_qw(fifo: &mut WordFifo, value: u128, channel: usize, name: &'static str) -> Result<(), DmaError> {
    for slot in 0..4 {
        let word = (value >> (32 * slot)) as u32;
        fifo.push(word).map_err(|_| DmaError::FifoOverflow { channel, fifo: name })?;
    }
    Ok(())
}

/// The primary (EE-side) DMA controller: ten channels sharing one bus,
/// serviced one quadword-or-tag-decode at a time.
pub struct EeDmac {
    pub channels: [Channel; CHANNEL_COUNT],
    pub control: DmaControl,
    pub status: DmaStatus,
    pub priority: PriorityControl,
    pub skip_qwc: u32,
    pub ring_size: u32,
    pub ring_base: u32,
    pub stall_address: u32,
    enable: u32,
    irq_line: bool,
    irq_edge: bool,
}

impl EeDmac {
    pub fn new() -> Self {
        Self {
            channels: std::array::from_fn(|index| Channel::new(Port::from_index(index))),
            control: DmaControl(0),
            status: DmaStatus(0),
            priority: PriorityControl(0),
            skip_qwc: 0,
            ring_size: 0,
            ring_base: 0,
            stall_address: 0,
            enable: 0,
            irq_line: false,
            irq_edge: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn read_u32(&mut self, address: u32) -> Result<u32, DmaError> {
        if let Some((index, register)) = channel::decode_register(address) {
            let channel = &self.channels[index];
            let value = match register {
                ChannelRegister::Chcr => channel.control.0,
                ChannelRegister::Madr => channel.madr,
                ChannelRegister::Qwc => channel.qwc,
                ChannelRegister::Tadr => channel.tadr,
                ChannelRegister::Asr0 | ChannelRegister::Asr1 => {
                    self.stack_register(index, register)?;
                    channel.asr[(register == ChannelRegister::Asr1) as usize]
                }
                ChannelRegister::Sadr => {
                    self.scratchpad_register(index, register)?;
                    channel.sadr
                }
            };
            return Ok(value);
        }
        match address {
            D_CTRL_ADDR_START => Ok(self.control.0),
            D_STAT_ADDR_START => Ok(self.status.0),
            D_PCR_ADDR_START => Ok(self.priority.0),
            D_SQWC_ADDR_START => Ok(self.skip_qwc),
            D_RBSR_ADDR_START => Ok(self.ring_size),
            D_RBOR_ADDR_START => Ok(self.ring_base),
            D_STADR_ADDR_START => Ok(self.stall_address),
            D_ENABLER_ADDR_START | D_ENABLEW_ADDR_START => Ok(self.enable),
            _ => Err(DmaError::UnmappedRegister { address, width: 32 }),
        }
    }

    pub fn write_u32(&mut self, address: u32, value: u32) -> Result<(), DmaError> {
        if let Some((index, register)) = channel::decode_register(address) {
            match register {
                ChannelRegister::Chcr => self.write_chcr(index, value),
                ChannelRegister::Madr => self.channels[index].madr = value & !0xF,
                ChannelRegister::Qwc => self.channels[index].qwc = value & 0xFFFF,
                ChannelRegister::Tadr => self.channels[index].tadr = value & !0xF,
                ChannelRegister::Asr0 | ChannelRegister::Asr1 => {
                    self.stack_register(index, register)?;
                    self.channels[index].asr[(register == ChannelRegister::Asr1) as usize] = value & !0xF;
                }
                ChannelRegister::Sadr => {
                    self.scratchpad_register(index, register)?;
                    self.channels[index].sadr = value & !0xF;
                }
            }
            return Ok(());
        }
        match address {
            D_CTRL_ADDR_START => self.control.0 = value,
            D_STAT_ADDR_START => self.write_stat(value),
            D_PCR_ADDR_START => self.priority.0 = value,
            D_SQWC_ADDR_START => self.skip_qwc = value,
            D_RBSR_ADDR_START => self.ring_size = value,
            D_RBOR_ADDR_START => self.ring_base = value,
            D_STADR_ADDR_START => self.stall_address = value,
            D_ENABLEW_ADDR_START => self.enable = value,
            D_ENABLER_ADDR_START => {
                return Err(DmaError::ReadOnlyRegister { register: "D_ENABLER" });
            }
            _ => return Err(DmaError::UnmappedRegister { address, width: 32 }),
        }
        Ok(())
    }

    /// Every primary-engine register is 32-bit access only; the real
    /// controller has no byte or halfword ports here.
    pub fn read_u16(&mut self, address: u32) -> Result<u16, DmaError> {
        Err(self.narrow_access(address, 16))
    }

    pub fn write_u16(&mut self, address: u32, _value: u16) -> Result<(), DmaError> {
        Err(self.narrow_access(address, 16))
    }

    pub fn read_u8(&mut self, address: u32) -> Result<u8, DmaError> {
        Err(self.narrow_access(address, 8))
    }

    pub fn write_u8(&mut self, address: u32, _value: u8) -> Result<(), DmaError> {
        Err(self.narrow_access(address, 8))
    }

    fn narrow_access(&self, address: u32, width: u8) -> DmaError {
        if let Some((channel, register)) = channel::decode_register(address) {
            return DmaError::UnsupportedChannelAccess {
                channel,
                register: register.name(),
                width,
            };
        }
        match Self::control_register_name(address) {
            Some(register) => DmaError::UnsupportedAccess { register, width },
            None => DmaError::UnmappedRegister { address, width },
        }
    }

    fn control_register_name(address: u32) -> Option<&'static str> {
        match address {
            D_CTRL_ADDR_START => Some("D_CTRL"),
            D_STAT_ADDR_START => Some("D_STAT"),
            D_PCR_ADDR_START => Some("D_PCR"),
            D_SQWC_ADDR_START => Some("D_SQWC"),
            D_RBSR_ADDR_START => Some("D_RBSR"),
            D_RBOR_ADDR_START => Some("D_RBOR"),
            D_STADR_ADDR_START => Some("D_STADR"),
            D_ENABLER_ADDR_START => Some("D_ENABLER"),
            D_ENABLEW_ADDR_START => Some("D_ENABLEW"),
            _ => None,
        }
    }

    fn stack_register(&self, channel: usize, register: ChannelRegister) -> Result<(), DmaError> {
        if Port::from_index(channel).has_address_stack() {
            Ok(())
        } else {
            Err(DmaError::MissingRegister {
                channel,
                register: register.name(),
            })
        }
    }

    fn scratchpad_register(&self, channel: usize, register: ChannelRegister) -> Result<(), DmaError> {
        if Port::from_index(channel).is_scratchpad() {
            Ok(())
        } else {
            Err(DmaError::MissingRegister {
                channel,
                register: register.name(),
            })
        }
    }

    fn write_chcr(&mut self, index: usize, value: u32) {
        let channel = &mut self.channels[index];
        let was_started = channel.control.start();
        // Bits 31:16 are the cached tag upper half and ignore writes.
        channel.control.0 = (channel.control.0 & 0xFFFF_0000) | (value & 0xFFFF);
        if !was_started && channel.control.start() {
            channel.tag_active = false;
            channel.chain_ended = false;
            tracing::debug!(
                target: "ps2_core::ee",
                channel = index,
                port = Port::from_index(index).name(),
                madr = %format!("{:08X}", channel.madr),
                tadr = %format!("{:08X}", channel.tadr),
                qwc = channel.qwc,
                mode = ?channel.control.mode(),
                "channel kicked"
            );
        }
    }

    fn write_stat(&mut self, value: u32) {
        let write = DmaStatus(value);
        let mut status = self.status;
        status.set_channel_pending(status.channel_pending() & !write.channel_pending());
        if write.bus_error() {
            status.set_bus_error(false);
        }
        status.set_channel_mask(status.channel_mask() ^ write.channel_mask());
        self.status = status;
        self.refresh_interrupts();
    }

    /// Override a channel's hardware request line. Modeled peers have
    /// theirs recomputed from FIFO occupancy on every invocation.
    pub fn set_request(&mut self, channel: usize, ready: bool) {
        self.channels[channel].request = ready;
    }

    /// Cross-processor readiness query: true once every channel watched
    /// by D_PCR.CPC has completed (unwatched channels pass by default).
    pub fn cpcond0(&self) -> bool {
        let pending = self.status.channel_pending() as u32;
        let cond = self.priority.cond() as u32;
        ((pending | !cond) & 0x3FF) == 0x3FF
    }

    /// Drains the edge latch: true once per false-to-true transition of
    /// the masked interrupt line.
    pub fn take_irq(&mut self) -> bool {
        std::mem::take(&mut self.irq_edge)
    }

    pub fn irq_line(&self) -> bool {
        self.irq_line
    }

    /// Service at most one unit of work: one quadword moved or one chain
    /// tag decoded, on the lowest-indexed ready channel.
    pub fn step(
        &mut self,
        bus: &mut impl Bus128,
        peers: &mut EePeers,
        sif: &mut Sif,
    ) -> Result<Option<usize>, DmaError> {
        if !self.control.enable() || self.enable & ENABLE_SUSPEND != 0 {
            return Ok(None);
        }
        self.update_requests(peers, sif);
        let Some(index) = (0..CHANNEL_COUNT)
            .find(|&index| self.channels[index].control.start() && self.channels[index].request)
        else {
            return Ok(None);
        };
        self.service(index, bus, peers, sif)?;
        Ok(Some(index))
    }

    fn update_requests(&mut self, peers: &EePeers, sif: &Sif) {
        for index in 0..CHANNEL_COUNT {
            let channel = &self.channels[index];
            let ready = match Port::from_index(index) {
                Port::Vif0 => peers.vif0.request_ready(),
                Port::Vif1 => {
                    if channel.control.from_memory() {
                        peers.vif1.request_ready()
                    } else {
                        peers.vif1.occupancy() >= 1
                    }
                }
                Port::Gif => peers.gif.request_ready(),
                Port::FromIpu => peers.from_ipu.occupancy() >= 1,
                Port::ToIpu => peers.to_ipu.request_ready(),
                Port::Sif0 => sif.sif0.occupancy() >= self.bridge_words_needed(index),
                Port::Sif1 => sif.sif1.request_ready(),
                Port::Sif2 => {
                    if channel.control.from_memory() {
                        sif.sif2.request_ready()
                    } else {
                        sif.sif2.occupancy() >= 4
                    }
                }
                Port::FromSpr | Port::ToSpr => true,
            };
            self.channels[index].request = ready;
        }
    }

    /// Words the SIF0 channel needs buffered before its next unit: two
    /// for a destination-chain tag, four for a data quadword.
    fn bridge_words_needed(&self, index: usize) -> usize {
        let channel = &self.channels[index];
        match channel.control.mode() {
            Ok(ChannelMode::Chain) if !channel.tag_active => 2,
            _ => 4,
        }
    }

    fn service(
        &mut self,
        index: usize,
        bus: &mut impl Bus128,
        peers: &mut EePeers,
        sif: &mut Sif,
    ) -> Result<(), DmaError> {
        let mode = self.channels[index]
            .control
            .mode()
            .map_err(|mode| DmaError::ReservedMode { channel: index, mode })?;
        match mode {
            ChannelMode::Interleave => Err(DmaError::UnmodeledMode {
                channel: index,
                mode: "interleave",
            }),
            ChannelMode::Normal => {
                if self.channels[index].qwc == 0 {
                    self.complete(index);
                    Ok(())
                } else {
                    self.move_quadword(index, mode, bus, peers, sif)
                }
            }
            ChannelMode::Chain => {
                if self.channels[index].qwc > 0 {
                    self.move_quadword(index, mode, bus, peers, sif)
                } else if self.channels[index].tag_active {
                    self.finish_tag_payload(index);
                    Ok(())
                } else {
                    self.decode_chain_tag(index, bus, sif)?;
                    if self.channels[index].qwc == 0 {
                        self.finish_tag_payload(index);
                    }
                    Ok(())
                }
            }
        }
    }

    fn decode_chain_tag(
        &mut self,
        index: usize,
        bus: &mut impl Bus128,
        sif: &mut Sif,
    ) -> Result<(), DmaError> {
        let port = Port::from_index(index);
        let tadr = self.channels[index].tadr;
        let tie = self.channels[index].control.tag_interrupt();
        let decode = match port {
            // The bridge supplies destination-chain tags word by word;
            // memory is never consulted.
            Port::Sif0 => {
                let lo = pop_word(&mut sif.sif0, index, "SIF0")?;
                let hi = pop_word(&mut sif.sif0, index, "SIF0")?;
                tag::decode_dest(index, (lo as u64) | ((hi as u64) << 32), tadr, tie)?
            }
            _ => {
                if self.channels[index].control.tag_transfer() {
                    return Err(DmaError::TagTransferUnsupported {
                        channel: index,
                        peer: port.name(),
                    });
                }
                tag::decode_source(index, bus.read_u128(tadr), tadr, tie)?
            }
        };
        let channel = &mut self.channels[index];
        channel.madr = decode.madr;
        channel.tadr = decode.tadr;
        channel.qwc = decode.qwc;
        channel.chain_ended = decode.chain_ended;
        channel.tag_active = true;
        channel.control.set_tag_upper(decode.tag_upper);
        tracing::trace!(
            target: "ps2_core::ee",
            channel = index,
            madr = %format!("{:08X}", decode.madr),
            tadr = %format!("{:08X}", decode.tadr),
            qwc = decode.qwc,
            ended = decode.chain_ended,
            "chain tag decoded"
        );
        Ok(())
    }

    fn move_quadword(
        &mut self,
        index: usize,
        mode: ChannelMode,
        bus: &mut impl Bus128,
        peers: &mut EePeers,
        sif: &mut Sif,
    ) -> Result<(), DmaError> {
        let port = Port::from_index(index);
        let madr = self.channels[index].madr;
        let sadr = self.channels[index].sadr;
        let from_memory = self.channels[index].control.from_memory();
        match port {
            Port::Vif0 => push_qw(&mut peers.vif0, bus.read_u128(madr), index, "VIF0")?,
            Port::Vif1 => {
                if from_memory {
                    push_qw(&mut peers.vif1, bus.read_u128(madr), index, "VIF1")?;
                } else {
                    let value = pop_qw(&mut peers.vif1, index, "VIF1")?;
                    bus.write_u128(madr, value);
                }
            }
            Port::Gif => push_qw(&mut peers.gif, bus.read_u128(madr), index, "GIF")?,
            Port::FromIpu => {
                let value = pop_qw(&mut peers.from_ipu, index, "fromIPU")?;
                bus.write_u128(madr, value);
            }
            Port::ToIpu => push_qw(&mut peers.to_ipu, bus.read_u128(madr), index, "toIPU")?,
            Port::Sif0 => {
                let value = pop_bridge_qw(&mut sif.sif0, index, "SIF0")?;
                bus.write_u128(madr, value);
            }
            Port::Sif1 => push_bridge_qw(&mut sif.sif1, bus.read_u128(madr), index, "SIF1")?,
            Port::Sif2 => {
                if from_memory {
                    push_bridge_qw(&mut sif.sif2, bus.read_u128(madr), index, "SIF2")?;
                } else {
                    let value = pop_bridge_qw(&mut sif.sif2, index, "SIF2")?;
                    bus.write_u128(madr, value);
                }
            }
            Port::FromSpr => {
                let value = bus.read_u128(SPR_FLAG | sadr);
                bus.write_u128(madr, value);
            }
            Port::ToSpr => {
                let value = bus.read_u128(madr);
                bus.write_u128(SPR_FLAG | sadr, value);
            }
        }
        let remaining = {
            let channel = &mut self.channels[index];
            channel.madr = madr.wrapping_add(tag::TAG_SIZE);
            if port.is_scratchpad() {
                channel.sadr = sadr.wrapping_add(tag::TAG_SIZE);
            }
            channel.qwc -= 1;
            channel.qwc
        };
        tracing::trace!(
            target: "ps2_core::ee",
            channel = index,
            port = port.name(),
            madr = %format!("{:08X}", madr),
            remaining,
            "quadword moved"
        );
        if remaining == 0 {
            match mode {
                ChannelMode::Normal => self.complete(index),
                ChannelMode::Chain => self.finish_tag_payload(index),
                ChannelMode::Interleave => unreachable!(),
            }
        }
        Ok(())
    }

    /// The in-flight tag's payload has drained: either the chain is done
    /// or the next invocation fetches the next tag.
    fn finish_tag_payload(&mut self, index: usize) {
        if self.channels[index].chain_ended {
            self.complete(index);
        } else {
            self.channels[index].tag_active = false;
        }
    }

    fn complete(&mut self, index: usize) {
        let channel = &mut self.channels[index];
        channel.control.set_start(false);
        channel.tag_active = false;
        channel.chain_ended = false;
        let pending = self.status.channel_pending() | (1u16 << index);
        self.status.set_channel_pending(pending);
        tracing::debug!(
            target: "ps2_core::ee",
            channel = index,
            port = Port::from_index(index).name(),
            "transfer complete"
        );
        self.refresh_interrupts();
    }

    fn refresh_interrupts(&mut self) {
        let line = self.status.channel_pending() & self.status.channel_mask() != 0;
        if line && !self.irq_line {
            self.irq_edge = true;
        }
        self.irq_line = line;
    }
}

impl Default for EeDmac {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LinearMemory;
    use channel::CHANNEL_BASES;

    const GIF: usize = 2;
    const SIF0: usize = 5;
    const SIF1: usize = 6;

    const CHCR_DIR: u32 = 1 << 0;
    const CHCR_CHAIN: u32 = 1 << 2;
    const CHCR_TTE: u32 = 1 << 6;
    const CHCR_STR: u32 = 1 << 8;

    fn setup() -> (EeDmac, LinearMemory, EePeers, Sif) {
        let mut dmac = EeDmac::new();
        dmac.write_u32(D_CTRL_ADDR_START, 1).unwrap();
        (dmac, LinearMemory::new(0x10000), EePeers::new(), Sif::new())
    }

    fn kick(dmac: &mut EeDmac, channel: usize, madr: u32, qwc: u32, tadr: u32, chcr: u32) {
        let base = CHANNEL_BASES[channel];
        dmac.write_u32(base + 0x10, madr).unwrap();
        dmac.write_u32(base + 0x20, qwc).unwrap();
        dmac.write_u32(base + 0x30, tadr).unwrap();
        dmac.write_u32(base, chcr).unwrap();
    }

    fn source_tag(qwc: u16, id: u8, irq: bool, addr: u32) -> u128 {
        let mut value = qwc as u64 | ((id as u64) << 28) | ((addr as u64) << 32);
        if irq {
            value |= 1 << 31;
        }
        value as u128
    }

    #[test]
    fn normal_mode_moves_one_quadword_per_invocation() {
        let (mut dmac, mut ram, mut peers, mut sif) = setup();
        for i in 0..3u32 {
            ram.write_u128(0x100 + i * 16, 0xA0 + i as u128);
        }
        kick(&mut dmac, GIF, 0x100, 3, 0, CHCR_DIR | CHCR_STR);

        for expected in 0..3usize {
            assert_eq!(dmac.step(&mut ram, &mut peers, &mut sif).unwrap(), Some(GIF));
            assert_eq!(peers.gif.occupancy(), expected + 1);
        }
        assert_eq!(peers.gif.pop(), Some(0xA0));

        // Completion landed on the invocation that drained QWC.
        let chcr = dmac.read_u32(CHANNEL_BASES[GIF]).unwrap();
        assert_eq!(chcr & CHCR_STR, 0);
        assert_eq!(dmac.read_u32(CHANNEL_BASES[GIF] + 0x20).unwrap(), 0);
        assert_ne!(dmac.status.channel_pending() & (1 << GIF), 0);
        assert_eq!(dmac.step(&mut ram, &mut peers, &mut sif).unwrap(), None);
    }

    #[test]
    fn chain_decodes_one_tag_then_moves_payload() {
        let (mut dmac, mut ram, mut peers, mut sif) = setup();
        let base = 0x1000u32;
        // CNT with two quadwords of payload, then an END tag right after
        // the payload.
        ram.write_u128(base as u32, source_tag(2, 1, false, 0));
        ram.write_u128(base + 0x10, 0x1111);
        ram.write_u128(base + 0x20, 0x2222);
        ram.write_u128(base + 0x30, source_tag(0, 7, false, 0));
        kick(&mut dmac, GIF, 0, 0, base, CHCR_DIR | CHCR_CHAIN | CHCR_STR);

        // First invocation decodes the CNT tag and moves no data.
        assert_eq!(dmac.step(&mut ram, &mut peers, &mut sif).unwrap(), Some(GIF));
        assert_eq!(dmac.read_u32(CHANNEL_BASES[GIF] + 0x10).unwrap(), base + 0x10);
        assert_eq!(dmac.read_u32(CHANNEL_BASES[GIF] + 0x30).unwrap(), base + 0x30);
        assert_eq!(dmac.read_u32(CHANNEL_BASES[GIF] + 0x20).unwrap(), 2);
        assert!(!dmac.channels[GIF].chain_ended);
        assert_eq!(peers.gif.occupancy(), 0);
        // The tag's upper half is cached into CHCR for read-back.
        let chcr = dmac.read_u32(CHANNEL_BASES[GIF]).unwrap();
        assert_eq!(chcr >> 16, ((source_tag(2, 1, false, 0) as u64) >> 16 & 0xFFFF) as u32);

        // Two more invocations drain the payload.
        dmac.step(&mut ram, &mut peers, &mut sif).unwrap();
        dmac.step(&mut ram, &mut peers, &mut sif).unwrap();
        assert_eq!(peers.gif.occupancy(), 2);
        assert_eq!(dmac.read_u32(CHANNEL_BASES[GIF] + 0x20).unwrap(), 0);
        assert_ne!(dmac.read_u32(CHANNEL_BASES[GIF]).unwrap() & CHCR_STR, 0);

        // Fourth invocation reads the END tag and completes.
        assert_eq!(dmac.step(&mut ram, &mut peers, &mut sif).unwrap(), Some(GIF));
        assert_eq!(dmac.read_u32(CHANNEL_BASES[GIF]).unwrap() & CHCR_STR, 0);
        assert_ne!(dmac.status.channel_pending() & (1 << GIF), 0);
    }

    #[test]
    fn mask_write_is_xor_toggle() {
        let (mut dmac, ..) = setup();
        let mask_bits = (1u32 << GIF) << 16;
        dmac.write_u32(D_STAT_ADDR_START, mask_bits).unwrap();
        assert_eq!(dmac.status.channel_mask(), 1 << GIF);
        dmac.write_u32(D_STAT_ADDR_START, mask_bits).unwrap();
        assert_eq!(dmac.status.channel_mask(), 0);
    }

    #[test]
    fn status_write_clears_only_named_pending_bits() {
        let (mut dmac, ..) = setup();
        dmac.status.set_channel_pending(0b101);
        dmac.write_u32(D_STAT_ADDR_START, 0b001).unwrap();
        assert_eq!(dmac.status.channel_pending(), 0b100);
    }

    #[test]
    fn irq_edge_fires_once_per_transition() {
        let (mut dmac, mut ram, mut peers, mut sif) = setup();
        dmac.write_u32(D_STAT_ADDR_START, (1u32 << GIF) << 16).unwrap();
        ram.write_u128(0, 0xFEED);
        kick(&mut dmac, GIF, 0, 1, 0, CHCR_DIR | CHCR_STR);
        dmac.step(&mut ram, &mut peers, &mut sif).unwrap();

        assert!(dmac.irq_line());
        assert!(dmac.take_irq());
        assert!(!dmac.take_irq());

        // Acknowledging the pending bit drops the line; the next
        // completion produces a fresh edge.
        dmac.write_u32(D_STAT_ADDR_START, 1 << GIF).unwrap();
        assert!(!dmac.irq_line());
        kick(&mut dmac, GIF, 0, 1, 0, CHCR_DIR | CHCR_STR);
        dmac.step(&mut ram, &mut peers, &mut sif).unwrap();
        assert!(dmac.take_irq());
    }

    #[test]
    fn full_gif_fifo_stalls_the_channel() {
        let (mut dmac, mut ram, mut peers, mut sif) = setup();
        while !peers.gif.is_full() {
            peers.gif.push(0).unwrap();
        }
        kick(&mut dmac, GIF, 0, 1, 0, CHCR_DIR | CHCR_STR);
        assert_eq!(dmac.step(&mut ram, &mut peers, &mut sif).unwrap(), None);
        peers.gif.pop();
        assert_eq!(dmac.step(&mut ram, &mut peers, &mut sif).unwrap(), Some(GIF));
    }

    #[test]
    fn lowest_index_ready_channel_wins() {
        let (mut dmac, mut ram, mut peers, mut sif) = setup();
        kick(&mut dmac, GIF, 0, 1, 0, CHCR_DIR | CHCR_STR);
        kick(&mut dmac, 0, 0x40, 1, 0, CHCR_DIR | CHCR_STR);
        assert_eq!(dmac.step(&mut ram, &mut peers, &mut sif).unwrap(), Some(0));
        assert_eq!(peers.vif0.occupancy(), 1);
        assert_eq!(peers.gif.occupancy(), 0);
        assert_eq!(dmac.step(&mut ram, &mut peers, &mut sif).unwrap(), Some(GIF));
    }

    #[test]
    fn clearing_start_takes_effect_by_the_next_invocation() {
        let (mut dmac, mut ram, mut peers, mut sif) = setup();
        kick(&mut dmac, GIF, 0, 4, 0, CHCR_DIR | CHCR_STR);
        dmac.step(&mut ram, &mut peers, &mut sif).unwrap();
        dmac.write_u32(CHANNEL_BASES[GIF], CHCR_DIR).unwrap();
        assert_eq!(dmac.step(&mut ram, &mut peers, &mut sif).unwrap(), None);
        assert_eq!(peers.gif.occupancy(), 1);
    }

    #[test]
    fn engine_enable_gates_all_dispatch() {
        let (mut dmac, mut ram, mut peers, mut sif) = setup();
        kick(&mut dmac, GIF, 0, 1, 0, CHCR_DIR | CHCR_STR);
        dmac.write_u32(D_CTRL_ADDR_START, 0).unwrap();
        assert_eq!(dmac.step(&mut ram, &mut peers, &mut sif).unwrap(), None);
        dmac.write_u32(D_CTRL_ADDR_START, 1).unwrap();
        dmac.write_u32(D_ENABLEW_ADDR_START, ENABLE_SUSPEND).unwrap();
        assert_eq!(dmac.step(&mut ram, &mut peers, &mut sif).unwrap(), None);
        dmac.write_u32(D_ENABLEW_ADDR_START, 0).unwrap();
        assert_eq!(dmac.step(&mut ram, &mut peers, &mut sif).unwrap(), Some(GIF));
    }

    #[test]
    fn tag_transfer_to_unsupporting_peer_is_fatal() {
        let (mut dmac, mut ram, mut peers, mut sif) = setup();
        ram.write_u128(0x500, source_tag(1, 1, false, 0));
        kick(&mut dmac, GIF, 0, 0, 0x500, CHCR_DIR | CHCR_CHAIN | CHCR_TTE | CHCR_STR);
        assert!(matches!(
            dmac.step(&mut ram, &mut peers, &mut sif),
            Err(DmaError::TagTransferUnsupported { channel: GIF, peer: "GIF" })
        ));
    }

    #[test]
    fn interleave_and_reserved_modes_are_fatal() {
        let (mut dmac, mut ram, mut peers, mut sif) = setup();
        kick(&mut dmac, GIF, 0, 1, 0, CHCR_DIR | (2 << 2) | CHCR_STR);
        assert!(matches!(
            dmac.step(&mut ram, &mut peers, &mut sif),
            Err(DmaError::UnmodeledMode { channel: GIF, mode: "interleave" })
        ));
        dmac.write_u32(CHANNEL_BASES[GIF], CHCR_DIR | (3 << 2) | CHCR_STR).unwrap();
        assert!(matches!(
            dmac.step(&mut ram, &mut peers, &mut sif),
            Err(DmaError::ReservedMode { channel: GIF, mode: 3 })
        ));
    }

    #[test]
    fn call_tag_is_fatal_not_silent() {
        let (mut dmac, mut ram, mut peers, mut sif) = setup();
        ram.write_u128(0x500, source_tag(1, 5, false, 0));
        kick(&mut dmac, GIF, 0, 0, 0x500, CHCR_DIR | CHCR_CHAIN | CHCR_STR);
        assert!(matches!(
            dmac.step(&mut ram, &mut peers, &mut sif),
            Err(DmaError::UnimplementedTag { channel: GIF, id: "CALL", .. })
        ));
    }

    #[test]
    fn sif0_chain_takes_tags_and_data_from_the_bridge() {
        let (mut dmac, mut ram, mut peers, mut sif) = setup();
        // Destination-chain CNT tag: one quadword to 0x200.
        let tag = source_tag(1, 1, false, 0x200) as u64;
        sif.sif0.push(tag as u32).unwrap();
        sif.sif0.push((tag >> 32) as u32).unwrap();
        for word in [0x1111_1111u32, 0x2222_2222, 0x3333_3333, 0x4444_4444] {
            sif.sif0.push(word).unwrap();
        }
        kick(&mut dmac, SIF0, 0, 0, 0, CHCR_CHAIN | CHCR_STR);

        assert_eq!(dmac.step(&mut ram, &mut peers, &mut sif).unwrap(), Some(SIF0));
        assert_eq!(dmac.read_u32(CHANNEL_BASES[SIF0] + 0x10).unwrap(), 0x200);
        assert_eq!(dmac.step(&mut ram, &mut peers, &mut sif).unwrap(), Some(SIF0));
        assert_eq!(
            ram.read_u128(0x200),
            0x4444_4444_3333_3333_2222_2222_1111_1111
        );

        // Nothing buffered: the request drops and the engine idles
        // rather than underflowing.
        assert_eq!(dmac.step(&mut ram, &mut peers, &mut sif).unwrap(), None);

        // An END tag closes the chain.
        let end = source_tag(0, 7, false, 0) as u64;
        sif.sif0.push(end as u32).unwrap();
        sif.sif0.push((end >> 32) as u32).unwrap();
        assert_eq!(dmac.step(&mut ram, &mut peers, &mut sif).unwrap(), Some(SIF0));
        assert_eq!(dmac.read_u32(CHANNEL_BASES[SIF0]).unwrap() & CHCR_STR, 0);
        assert_ne!(dmac.status.channel_pending() & (1 << SIF0), 0);
    }

    #[test]
    fn sif1_splits_quadwords_into_bridge_words() {
        let (mut dmac, mut ram, mut peers, mut sif) = setup();
        ram.write_u128(0x300, 0x0D0C_0B0A_0908_0706_0504_0302_0100_FFFE);
        kick(&mut dmac, SIF1, 0x300, 1, 0, CHCR_DIR | CHCR_STR);
        dmac.step(&mut ram, &mut peers, &mut sif).unwrap();
        assert_eq!(sif.sif1.pop(), Some(0x0100_FFFE));
        assert_eq!(sif.sif1.pop(), Some(0x0504_0302));
        assert_eq!(sif.sif1.pop(), Some(0x0908_0706));
        assert_eq!(sif.sif1.pop(), Some(0x0D0C_0B0A));
    }

    #[test]
    fn scratchpad_pair_copies_between_ram_and_spr() {
        let (mut dmac, mut ram, mut peers, mut sif) = setup();
        ram.write_u128(0x600, 0xCAFE);
        let to_spr = CHANNEL_BASES[9];
        dmac.write_u32(to_spr + 0x80, 0x40).unwrap();
        kick(&mut dmac, 9, 0x600, 1, 0, CHCR_DIR | CHCR_STR);
        dmac.step(&mut ram, &mut peers, &mut sif).unwrap();
        assert_eq!(ram.read_u128(SPR_FLAG | 0x40), 0xCAFE);

        let from_spr = CHANNEL_BASES[8];
        dmac.write_u32(from_spr + 0x80, 0x40).unwrap();
        kick(&mut dmac, 8, 0x700, 1, 0, CHCR_STR);
        dmac.step(&mut ram, &mut peers, &mut sif).unwrap();
        assert_eq!(ram.read_u128(0x700), 0xCAFE);
    }

    #[test]
    fn narrow_accesses_name_the_register() {
        let (mut dmac, ..) = setup();
        assert_eq!(
            dmac.read_u16(CHANNEL_BASES[GIF]),
            Err(DmaError::UnsupportedChannelAccess {
                channel: GIF,
                register: "CHCR",
                width: 16,
            })
        );
        assert_eq!(
            dmac.write_u8(D_STAT_ADDR_START, 0),
            Err(DmaError::UnsupportedAccess { register: "D_STAT", width: 8 })
        );
    }

    #[test]
    fn registers_absent_on_a_channel_are_rejected() {
        let (mut dmac, ..) = setup();
        assert_eq!(
            dmac.read_u32(CHANNEL_BASES[SIF0] + 0x40),
            Err(DmaError::MissingRegister { channel: SIF0, register: "ASR0" })
        );
        assert_eq!(
            dmac.read_u32(CHANNEL_BASES[GIF] + 0x80),
            Err(DmaError::MissingRegister { channel: GIF, register: "SADR" })
        );
    }

    #[test]
    fn writable_bits_round_trip() {
        let (mut dmac, ..) = setup();
        let base = CHANNEL_BASES[GIF];
        dmac.write_u32(base, 0xFFFF_FFFF).unwrap();
        // The tag half of CHCR ignores writes.
        assert_eq!(dmac.read_u32(base).unwrap(), 0x0000_FFFF);
        dmac.write_u32(base + 0x10, 0xFFFF_FFFF).unwrap();
        assert_eq!(dmac.read_u32(base + 0x10).unwrap(), 0xFFFF_FFF0);
        dmac.write_u32(base + 0x20, 0xFFFF_FFFF).unwrap();
        assert_eq!(dmac.read_u32(base + 0x20).unwrap(), 0xFFFF);
    }

    #[test]
    fn cpcond0_waits_for_watched_channels() {
        let (mut dmac, mut ram, mut peers, mut sif) = setup();
        dmac.write_u32(D_PCR_ADDR_START, 1 << GIF).unwrap();
        assert!(!dmac.cpcond0());
        kick(&mut dmac, GIF, 0, 1, 0, CHCR_DIR | CHCR_STR);
        dmac.step(&mut ram, &mut peers, &mut sif).unwrap();
        assert!(dmac.cpcond0());
    }

    #[test]
    fn vif1_direction_reverses_with_the_control_bit() {
        let (mut dmac, mut ram, mut peers, mut sif) = setup();
        peers.vif1.push(0xBEEF).unwrap();
        kick(&mut dmac, 1, 0x800, 1, 0, CHCR_STR);
        dmac.step(&mut ram, &mut peers, &mut sif).unwrap();
        assert_eq!(ram.read_u128(0x800), 0xBEEF);
    }
}
