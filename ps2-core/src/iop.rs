pub mod channel;
pub mod tag;

use crate::bus::Bus32;
use crate::error::DmaError;
use crate::fifo::{PeerFifo, Sif, WordFifo};
use channel::{CHANNEL_COUNT, Channel, ChannelRegister, Port, TransferMode};
use proc_bitfield::bitfield;
use tag::ChainTag;

crate::define_addr!(DPCR_ADDR, 0x1F80_10F0, 0, 4, 4);
crate::define_addr!(DICR_ADDR, 0x1F80_10F0, 1, 4, 4);
crate::define_addr!(DPCR2_ADDR, 0x1F80_1570, 0, 4, 4);
crate::define_addr!(DICR2_ADDR, 0x1F80_1570, 1, 4, 4);
crate::define_addr!(DMA_ENABLE_ADDR, 0x1F80_1570, 2, 4, 4);
crate::define_addr!(DMA_SUPPRESS_ADDR, 0x1F80_1570, 3, 4, 4);

/// DPCR/DPCR2 power-on value: priorities laid out, every enable bit
/// clear.
const PRIORITY_RESET: u32 = 0x0765_4321;

bitfield! {
    /// DICR. Flag bits are write-1-to-clear; mask and master enable are
    /// plain assignment, unlike the primary engine's XOR mask.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct InterruptControl(pub u32): Debug, FromStorage, IntoStorage, DerefStorage {
        pub bus_error: bool @ 15,
        pub mask: u8 @ 16..=22,
        pub master_enable: bool @ 23,
        pub flags: u8 @ 24..=30,
        pub master_flag: bool @ 31,
    }
}

bitfield! {
    /// DICR2: the extension channels' flag/mask pair plus the
    /// per-channel tag-interrupt bits.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct InterruptControl2(pub u32): Debug, FromStorage, IntoStorage, DerefStorage {
        pub tag_pending: u16 @ 0..=12,
        pub mask: u8 @ 16..=21,
        pub flags: u8 @ 24..=29,
    }
}

/// The serial interface's command/response FIFOs.
pub struct Sio2Ports {
    pub tx: WordFifo,
    pub rx: WordFifo,
}

impl Sio2Ports {
    pub fn new() -> Self {
        Self {
            tx: WordFifo::sio2(),
            rx: WordFifo::sio2(),
        }
    }
}

impl Default for Sio2Ports {
    fn default() -> Self {
        Self::new()
    }
}

fn pop_word(fifo: &mut WordFifo, channel: usize, name: &'static str) -> Result<u32, DmaError> {
    fifo.pop().ok_or(DmaError::FifoUnderflow { channel, fifo: name })
}

fn push_word(fifo: &mut WordFifo, value: u32, channel: usize, name: &'static str) -> Result<(), DmaError> {
    fifo.push(value).map_err(|_| DmaError::FifoOverflow { channel, fifo: name })
}

/// The secondary (IOP-side) DMA controller: thirteen word-granular
/// channels gated by the two priority-control registers.
pub struct IopDmac {
    pub channels: [Channel; CHANNEL_COUNT],
    pub priority: u32,
    pub priority2: u32,
    pub interrupt: InterruptControl,
    pub interrupt2: InterruptControl2,
    dma_enable: u32,
    interrupt_suppress: u32,
    irq_line: bool,
    irq_edge: bool,
}

impl IopDmac {
    pub fn new() -> Self {
        Self {
            channels: std::array::from_fn(|index| Channel::new(Port::from_index(index))),
            priority: PRIORITY_RESET,
            priority2: PRIORITY_RESET,
            interrupt: InterruptControl(0),
            interrupt2: InterruptControl2(0),
            dma_enable: 1,
            interrupt_suppress: 0,
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
            return Ok(match register {
                ChannelRegister::Madr => channel.madr,
                ChannelRegister::Bcr => channel.block.0,
                ChannelRegister::Chcr => channel.control.0,
                ChannelRegister::Tadr => channel.tadr,
            });
        }
        match address {
            DPCR_ADDR_START => Ok(self.priority),
            DICR_ADDR_START => Ok(self.interrupt.0),
            DPCR2_ADDR_START => Ok(self.priority2),
            DICR2_ADDR_START => Ok(self.interrupt2.0),
            DMA_ENABLE_ADDR_START => Ok(self.dma_enable),
            DMA_SUPPRESS_ADDR_START => Ok(self.interrupt_suppress),
            _ => Err(DmaError::UnmappedRegister { address, width: 32 }),
        }
    }

    pub fn write_u32(&mut self, address: u32, value: u32) -> Result<(), DmaError> {
        if let Some((index, register)) = channel::decode_register(address) {
            match register {
                ChannelRegister::Madr => self.channels[index].madr = value & 0x00FF_FFFC,
                ChannelRegister::Bcr => self.channels[index].block.0 = value,
                ChannelRegister::Chcr => self.write_chcr(index, value),
                ChannelRegister::Tadr => self.channels[index].tadr = value & 0x00FF_FFFC,
            }
            return Ok(());
        }
        match address {
            DPCR_ADDR_START => self.priority = value,
            DICR_ADDR_START => self.write_dicr(value),
            DPCR2_ADDR_START => self.priority2 = value,
            DICR2_ADDR_START => self.write_dicr2(value),
            DMA_ENABLE_ADDR_START => self.dma_enable = value,
            DMA_SUPPRESS_ADDR_START => {
                self.interrupt_suppress = value;
                self.refresh_interrupts();
            }
            _ => return Err(DmaError::UnmappedRegister { address, width: 32 }),
        }
        Ok(())
    }

    /// BCR is the one channel register with halfword ports: offset 0 is
    /// the block size, offset 2 the block count.
    pub fn read_u16(&mut self, address: u32) -> Result<u16, DmaError> {
        if let Some((index, ChannelRegister::Bcr)) = channel::decode_register(address) {
            let block = &self.channels[index].block;
            return Ok(match address & 0x2 {
                0 => block.block_size(),
                _ => block.block_count(),
            });
        }
        Err(self.narrow_access(address, 16))
    }

    pub fn write_u16(&mut self, address: u32, value: u16) -> Result<(), DmaError> {
        if let Some((index, ChannelRegister::Bcr)) = channel::decode_register(address) {
            let block = &mut self.channels[index].block;
            match address & 0x2 {
                0 => block.set_block_size(value),
                _ => block.set_block_count(value),
            }
            return Ok(());
        }
        Err(self.narrow_access(address, 16))
    }

    pub fn read_u8(&mut self, address: u32) -> Result<u8, DmaError> {
        if let Some((index, ChannelRegister::Bcr)) = channel::decode_register(address) {
            let lane = (address & 0x3) * 8;
            return Ok((self.channels[index].block.0 >> lane) as u8);
        }
        Err(self.narrow_access(address, 8))
    }

    pub fn write_u8(&mut self, address: u32, value: u8) -> Result<(), DmaError> {
        if let Some((index, ChannelRegister::Bcr)) = channel::decode_register(address) {
            let lane = (address & 0x3) * 8;
            let block = &mut self.channels[index].block;
            block.0 = (block.0 & !(0xFF << lane)) | ((value as u32) << lane);
            return Ok(());
        }
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
        let register = match address {
            DPCR_ADDR_START => "DPCR",
            DICR_ADDR_START => "DICR",
            DPCR2_ADDR_START => "DPCR2",
            DICR2_ADDR_START => "DICR2",
            DMA_ENABLE_ADDR_START => "DMA enable",
            DMA_SUPPRESS_ADDR_START => "DMA interrupt suppress",
            _ => return DmaError::UnmappedRegister { address, width },
        };
        DmaError::UnsupportedAccess { register, width }
    }

    fn write_chcr(&mut self, index: usize, value: u32) {
        let channel = &mut self.channels[index];
        let was_started = channel.control.start();
        channel.control.0 = value;
        if !was_started && channel.control.start() {
            channel.tag_active = false;
            channel.chain_ended = false;
            // The derived word count is fixed once, at activation.
            channel.remaining = match channel.control.transfer_mode() {
                Ok(mode) => channel.total_words(mode),
                Err(_) => 0,
            };
            tracing::debug!(
                target: "ps2_core::iop",
                channel = index,
                port = Port::from_index(index).name(),
                madr = %format!("{:08X}", channel.madr),
                words = channel.remaining,
                mode = ?channel.control.transfer_mode(),
                "channel kicked"
            );
        }
    }

    fn write_dicr(&mut self, value: u32) {
        let write = InterruptControl(value);
        let mut register = self.interrupt;
        register.set_flags(register.flags() & !write.flags());
        if write.bus_error() {
            register.set_bus_error(false);
        }
        register.set_mask(write.mask());
        register.set_master_enable(write.master_enable());
        self.interrupt = register;
        self.refresh_interrupts();
    }

    fn write_dicr2(&mut self, value: u32) {
        let write = InterruptControl2(value);
        let mut register = self.interrupt2;
        register.set_tag_pending(register.tag_pending() & !write.tag_pending());
        register.set_flags(register.flags() & !write.flags());
        register.set_mask(write.mask());
        self.interrupt2 = register;
        self.refresh_interrupts();
    }

    fn channel_enabled(&self, index: usize) -> bool {
        if index < 7 {
            self.priority >> (index * 4 + 3) & 1 != 0
        } else {
            self.priority2 >> ((index - 7) * 4 + 3) & 1 != 0
        }
    }

    pub fn set_request(&mut self, channel: usize, ready: bool) {
        self.channels[channel].request = ready;
    }

    pub fn take_irq(&mut self) -> bool {
        std::mem::take(&mut self.irq_edge)
    }

    pub fn irq_line(&self) -> bool {
        self.irq_line
    }

    /// Service at most one unit of work: one word moved or one chain tag
    /// decoded, on the lowest-indexed ready and enabled channel.
    pub fn step(
        &mut self,
        bus: &mut impl Bus32,
        sif: &mut Sif,
        sio2: &mut Sio2Ports,
    ) -> Result<Option<usize>, DmaError> {
        if self.dma_enable & 1 == 0 {
            return Ok(None);
        }
        self.update_requests(sif, sio2);
        let Some(index) = (0..CHANNEL_COUNT).find(|&index| {
            let channel = &self.channels[index];
            channel.control.start() && channel.request && self.channel_enabled(index)
        }) else {
            return Ok(None);
        };
        self.service(index, bus, sif, sio2)?;
        Ok(Some(index))
    }

    fn update_requests(&mut self, sif: &Sif, sio2: &Sio2Ports) {
        for index in 0..CHANNEL_COUNT {
            let channel = &self.channels[index];
            let ready = match Port::from_index(index) {
                Port::Sif0 => sif.sif0.request_ready(),
                Port::Sif1 => {
                    let needed = match channel.control.transfer_mode() {
                        Ok(TransferMode::LinkedList) if !channel.tag_active => 2,
                        _ => 1,
                    };
                    sif.sif1.occupancy() >= needed
                }
                Port::Sif2 => {
                    if channel.control.from_memory() {
                        sif.sif2.request_ready()
                    } else {
                        sif.sif2.occupancy() >= 1
                    }
                }
                Port::Sio2In => sio2.tx.request_ready(),
                Port::Sio2Out => sio2.rx.occupancy() >= 1,
                // Unmodeled ports keep whatever software last set.
                _ => continue,
            };
            self.channels[index].request = ready;
        }
    }

    fn service(
        &mut self,
        index: usize,
        bus: &mut impl Bus32,
        sif: &mut Sif,
        sio2: &mut Sio2Ports,
    ) -> Result<(), DmaError> {
        let port = Port::from_index(index);
        if !port.is_modeled() {
            return Err(DmaError::UnmodeledChannel {
                channel: index,
                name: port.name(),
            });
        }
        let mode = self.channels[index]
            .control
            .transfer_mode()
            .map_err(|mode| DmaError::ReservedMode { channel: index, mode })?;
        match mode {
            TransferMode::Burst | TransferMode::Slice => {
                if self.channels[index].remaining == 0 {
                    self.complete(index);
                    Ok(())
                } else {
                    self.move_word(index, mode, bus, sif, sio2)
                }
            }
            TransferMode::LinkedList => {
                if !port.supports_chain() {
                    return Err(DmaError::UnmodeledMode {
                        channel: index,
                        mode: "linked-list",
                    });
                }
                if self.channels[index].remaining > 0 {
                    self.move_word(index, mode, bus, sif, sio2)
                } else if self.channels[index].tag_active {
                    self.finish_tag_payload(index);
                    Ok(())
                } else {
                    self.decode_chain_tag(index, bus, sif)?;
                    if self.channels[index].remaining == 0 {
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
        bus: &mut impl Bus32,
        sif: &mut Sif,
    ) -> Result<(), DmaError> {
        let (word0, word1) = match Port::from_index(index) {
            Port::Sif0 => {
                let tadr = self.channels[index].tadr;
                let word0 = bus.read_u32(tadr);
                let word1 = bus.read_u32(tadr.wrapping_add(4));
                self.channels[index].tadr = tadr.wrapping_add(8);
                (word0, word1)
            }
            Port::Sif1 => {
                let word0 = pop_word(&mut sif.sif1, index, "SIF1")?;
                let word1 = pop_word(&mut sif.sif1, index, "SIF1")?;
                (word0, word1)
            }
            _ => unreachable!(),
        };
        let tag = ChainTag::decode(word0, word1);
        let channel = &mut self.channels[index];
        channel.madr = tag.madr;
        channel.remaining = tag.words;
        channel.chain_ended = tag.chain_ended();
        channel.tag_active = true;
        tracing::trace!(
            target: "ps2_core::iop",
            channel = index,
            madr = %format!("{:08X}", tag.madr),
            words = tag.words,
            irq = tag.irq,
            end = tag.end,
            "chain tag decoded"
        );
        if tag.irq {
            let pending = self.interrupt2.tag_pending() | (1u16 << index);
            self.interrupt2.set_tag_pending(pending);
            self.refresh_interrupts();
        }
        Ok(())
    }

    fn move_word(
        &mut self,
        index: usize,
        mode: TransferMode,
        bus: &mut impl Bus32,
        sif: &mut Sif,
        sio2: &mut Sio2Ports,
    ) -> Result<(), DmaError> {
        let port = Port::from_index(index);
        let madr = self.channels[index].madr;
        let from_memory = self.channels[index].control.from_memory();
        match port {
            Port::Sif0 => push_word(&mut sif.sif0, bus.read_u32(madr), index, "SIF0")?,
            Port::Sif1 => {
                let value = pop_word(&mut sif.sif1, index, "SIF1")?;
                bus.write_u32(madr, value);
            }
            Port::Sif2 => {
                if from_memory {
                    push_word(&mut sif.sif2, bus.read_u32(madr), index, "SIF2")?;
                } else {
                    let value = pop_word(&mut sif.sif2, index, "SIF2")?;
                    bus.write_u32(madr, value);
                }
            }
            Port::Sio2In => push_word(&mut sio2.tx, bus.read_u32(madr), index, "SIO2in")?,
            Port::Sio2Out => {
                let value = pop_word(&mut sio2.rx, index, "SIO2out")?;
                bus.write_u32(madr, value);
            }
            _ => unreachable!(),
        }
        let remaining = {
            let channel = &mut self.channels[index];
            channel.madr = madr.wrapping_add_signed(channel.madr_step()) & 0x00FF_FFFF;
            channel.remaining -= 1;
            channel.remaining
        };
        tracing::trace!(
            target: "ps2_core::iop",
            channel = index,
            port = port.name(),
            madr = %format!("{:08X}", madr),
            remaining,
            "word moved"
        );
        if remaining == 0 {
            match mode {
                TransferMode::Burst | TransferMode::Slice => self.complete(index),
                TransferMode::LinkedList => self.finish_tag_payload(index),
            }
        }
        Ok(())
    }

    fn finish_tag_payload(&mut self, index: usize) {
        if self.channels[index].chain_ended {
            self.complete(index);
        } else {
            self.channels[index].tag_active = false;
        }
    }

    fn complete(&mut self, index: usize) {
        {
            let channel = &mut self.channels[index];
            channel.control.set_start(false);
            channel.tag_active = false;
            channel.chain_ended = false;
        }
        if index < 7 {
            let flags = self.interrupt.flags() | (1u8 << index);
            self.interrupt.set_flags(flags);
        } else {
            let flags = self.interrupt2.flags() | (1u8 << (index - 7));
            self.interrupt2.set_flags(flags);
        }
        tracing::debug!(
            target: "ps2_core::iop",
            channel = index,
            port = Port::from_index(index).name(),
            "transfer complete"
        );
        self.refresh_interrupts();
    }

    fn refresh_interrupts(&mut self) {
        let pending1 = self.interrupt.flags() & self.interrupt.mask();
        let pending2 = self.interrupt2.flags() & self.interrupt2.mask();
        // The tag-interrupt term skips both the per-channel masks and
        // the master enable; the BIOS depends on it.
        let master = self.interrupt.bus_error()
            || (self.interrupt.master_enable() && (pending1 | pending2) != 0)
            || self.interrupt2.tag_pending() != 0;
        self.interrupt.set_master_flag(master);
        if master && !self.irq_line && self.interrupt_suppress & 1 == 0 {
            self.irq_edge = true;
        }
        self.irq_line = master;
    }
}

impl Default for IopDmac {
    fn default() -> Self {
        Self::new()
    }
}
