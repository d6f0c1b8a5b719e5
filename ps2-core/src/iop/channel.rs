use proc_bitfield::bitfield;

pub const CHANNEL_COUNT: usize = 13;

/// Channels 0-6 sit in the original register block, 7-12 in the
/// extension block.
pub const PRIMARY_BLOCK_START: u32 = 0x1F80_1080;
pub const PRIMARY_BLOCK_END: u32 = 0x1F80_10EF;
pub const EXTENSION_BLOCK_START: u32 = 0x1F80_1500;
pub const EXTENSION_BLOCK_END: u32 = 0x1F80_155F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    MdecIn,
    MdecOut,
    Sif2,
    Cdvd,
    Spu2,
    Pio,
    Otc,
    Spu2b,
    Dev9,
    Sif0,
    Sif1,
    Sio2In,
    Sio2Out,
}

impl Port {
    pub const fn from_index(index: usize) -> Port {
        match index {
            0 => Port::MdecIn,
            1 => Port::MdecOut,
            2 => Port::Sif2,
            3 => Port::Cdvd,
            4 => Port::Spu2,
            5 => Port::Pio,
            6 => Port::Otc,
            7 => Port::Spu2b,
            8 => Port::Dev9,
            9 => Port::Sif0,
            10 => Port::Sif1,
            11 => Port::Sio2In,
            12 => Port::Sio2Out,
            _ => unreachable!(),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Port::MdecIn => "MDECin",
            Port::MdecOut => "MDECout",
            Port::Sif2 => "SIF2",
            Port::Cdvd => "CDVD",
            Port::Spu2 => "SPU2",
            Port::Pio => "PIO",
            Port::Otc => "OTC",
            Port::Spu2b => "SPU2 core1",
            Port::Dev9 => "DEV9",
            Port::Sif0 => "SIF0",
            Port::Sif1 => "SIF1",
            Port::Sio2In => "SIO2in",
            Port::Sio2Out => "SIO2out",
        }
    }

    /// Ports with a modeled peer. The rest hold registers that read and
    /// write normally but cannot be serviced.
    pub const fn is_modeled(self) -> bool {
        matches!(
            self,
            Port::Sif2 | Port::Sif0 | Port::Sif1 | Port::Sio2In | Port::Sio2Out
        )
    }

    /// Chain transfers exist only on the bridge pair: SIF0 walks tags in
    /// memory, SIF1 has them supplied by the peer.
    pub const fn supports_chain(self) -> bool {
        matches!(self, Port::Sif0 | Port::Sif1)
    }

    pub const fn default_request(self) -> bool {
        !matches!(self, Port::Sif1 | Port::Sio2Out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Burst,
    Slice,
    LinkedList,
}

impl TryFrom<u8> for TransferMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TransferMode::Burst),
            1 => Ok(TransferMode::Slice),
            2 => Ok(TransferMode::LinkedList),
            _ => Err(value),
        }
    }
}

impl From<TransferMode> for u8 {
    fn from(mode: TransferMode) -> u8 {
        mode as u8
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChannelControl(pub u32): Debug, FromStorage, IntoStorage, DerefStorage {
        pub from_memory: bool @ 0,
        pub decrement_madr: bool @ 1,
        pub chopping_enable: bool @ 8,
        pub transfer_mode: u8 [try_get TransferMode, set TransferMode] @ 9..=10,
        pub chopping_dma_window: u8 @ 16..=18,
        pub chopping_cpu_window: u8 @ 20..=22,
        pub start: bool @ 24,
        pub force_start: bool @ 28,
        pub bus_snooping: bool @ 30,
    }
}

bitfield! {
    /// D#_BCR: total length is block size times block count for slice
    /// transfers, block size alone for bursts.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockControl(pub u32): Debug, FromStorage, IntoStorage, DerefStorage {
        pub block_size: u16 @ 0..=15,
        pub block_count: u16 @ 16..=31,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRegister {
    Madr,
    Bcr,
    Chcr,
    Tadr,
}

impl ChannelRegister {
    pub const fn name(self) -> &'static str {
        match self {
            ChannelRegister::Madr => "MADR",
            ChannelRegister::Bcr => "BCR",
            ChannelRegister::Chcr => "CHCR",
            ChannelRegister::Tadr => "TADR",
        }
    }
}

pub fn decode_register(address: u32) -> Option<(usize, ChannelRegister)> {
    let (index, offset) = match address {
        PRIMARY_BLOCK_START..=PRIMARY_BLOCK_END => {
            (((address - PRIMARY_BLOCK_START) >> 4) as usize, address & 0xF)
        }
        EXTENSION_BLOCK_START..=EXTENSION_BLOCK_END => {
            (7 + ((address - EXTENSION_BLOCK_START) >> 4) as usize, address & 0xF)
        }
        _ => return None,
    };
    let register = match offset & !0x3 {
        0x0 => ChannelRegister::Madr,
        0x4 => ChannelRegister::Bcr,
        0x8 => ChannelRegister::Chcr,
        0xC => ChannelRegister::Tadr,
        _ => unreachable!(),
    };
    Some((index, register))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub control: ChannelControl,
    pub madr: u32,
    pub block: BlockControl,
    pub tadr: u32,
    /// Words left in the current burst/slice activation or tag payload.
    pub remaining: u32,
    pub tag_active: bool,
    pub chain_ended: bool,
    pub request: bool,
}

impl Channel {
    pub fn new(port: Port) -> Self {
        Self {
            control: ChannelControl(0),
            madr: 0,
            block: BlockControl(0),
            tadr: 0,
            remaining: 0,
            tag_active: false,
            chain_ended: false,
            request: port.default_request(),
        }
    }

    pub fn reset(&mut self, port: Port) {
        *self = Self::new(port);
    }

    /// Derived word count, fixed once at activation.
    pub fn total_words(&self, mode: TransferMode) -> u32 {
        match mode {
            TransferMode::Burst => match self.block.block_size() {
                0 => 0x1_0000,
                size => size as u32,
            },
            TransferMode::Slice => self.block.block_size() as u32 * self.block.block_count() as u32,
            TransferMode::LinkedList => 0,
        }
    }

    pub fn madr_step(&self) -> i32 {
        if self.control.decrement_madr() { -4 } else { 4 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_word_bit_layout_is_exact() {
        let control = ChannelControl(0x0100_0201);
        assert!(control.from_memory());
        assert!(!control.decrement_madr());
        assert_eq!(control.transfer_mode(), Ok(TransferMode::Slice));
        assert!(control.start());
        assert!(!control.force_start());

        let mut control = ChannelControl(0);
        control.set_transfer_mode(TransferMode::LinkedList);
        control.set_decrement_madr(true);
        assert_eq!(control.0, (2 << 9) | (1 << 1));
        assert_eq!(ChannelControl(3 << 9).transfer_mode(), Err(3));
    }

    #[test]
    fn block_length_derivation() {
        let mut channel = Channel::new(Port::Sio2In);
        channel.block.set_block_size(4);
        channel.block.set_block_count(3);
        assert_eq!(channel.total_words(TransferMode::Slice), 12);
        assert_eq!(channel.total_words(TransferMode::Burst), 4);
        channel.block.set_block_size(0);
        assert_eq!(channel.total_words(TransferMode::Burst), 0x1_0000);
        assert_eq!(channel.total_words(TransferMode::LinkedList), 0);
    }

    #[test]
    fn register_decode_covers_both_blocks() {
        assert_eq!(decode_register(0x1F80_1080), Some((0, ChannelRegister::Madr)));
        assert_eq!(decode_register(0x1F80_10C8), Some((4, ChannelRegister::Chcr)));
        assert_eq!(decode_register(0x1F80_1500), Some((7, ChannelRegister::Madr)));
        assert_eq!(decode_register(0x1F80_1524), Some((9, ChannelRegister::Bcr)));
        assert_eq!(decode_register(0x1F80_155C), Some((12, ChannelRegister::Tadr)));
        assert_eq!(decode_register(0x1F80_1070), None);
        assert_eq!(decode_register(0x1F80_1560), None);
    }
}
