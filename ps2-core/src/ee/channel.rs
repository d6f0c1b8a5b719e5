use proc_bitfield::bitfield;

pub const CHANNEL_COUNT: usize = 10;

/// Channel register blocks in EE I/O space. Strides are not uniform, so
/// the decode walks this table instead of a formula.
pub const CHANNEL_BASES: [u32; CHANNEL_COUNT] = [
    0x1000_8000, // VIF0
    0x1000_9000, // VIF1
    0x1000_A000, // GIF
    0x1000_B000, // fromIPU
    0x1000_B400, // toIPU
    0x1000_C000, // SIF0
    0x1000_C400, // SIF1
    0x1000_C800, // SIF2
    0x1000_D000, // fromSPR
    0x1000_D400, // toSPR
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    Vif0,
    Vif1,
    Gif,
    FromIpu,
    ToIpu,
    Sif0,
    Sif1,
    Sif2,
    FromSpr,
    ToSpr,
}

impl Port {
    pub const fn from_index(index: usize) -> Port {
        match index {
            0 => Port::Vif0,
            1 => Port::Vif1,
            2 => Port::Gif,
            3 => Port::FromIpu,
            4 => Port::ToIpu,
            5 => Port::Sif0,
            6 => Port::Sif1,
            7 => Port::Sif2,
            8 => Port::FromSpr,
            9 => Port::ToSpr,
            _ => unreachable!(),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Port::Vif0 => "VIF0",
            Port::Vif1 => "VIF1",
            Port::Gif => "GIF",
            Port::FromIpu => "fromIPU",
            Port::ToIpu => "toIPU",
            Port::Sif0 => "SIF0",
            Port::Sif1 => "SIF1",
            Port::Sif2 => "SIF2",
            Port::FromSpr => "fromSPR",
            Port::ToSpr => "toSPR",
        }
    }

    /// Channels that can walk source chains carry the two-deep address
    /// stack for CALL/RET tags.
    pub const fn has_address_stack(self) -> bool {
        matches!(self, Port::Vif0 | Port::Vif1 | Port::Gif)
    }

    pub const fn is_scratchpad(self) -> bool {
        matches!(self, Port::FromSpr | Port::ToSpr)
    }

    /// Hardware request-line state before any FIFO has been observed.
    pub const fn default_request(self) -> bool {
        !matches!(self, Port::FromIpu | Port::Sif0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Normal,
    Chain,
    Interleave,
}

impl TryFrom<u8> for ChannelMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ChannelMode::Normal),
            1 => Ok(ChannelMode::Chain),
            2 => Ok(ChannelMode::Interleave),
            _ => Err(value),
        }
    }
}

impl From<ChannelMode> for u8 {
    fn from(mode: ChannelMode) -> u8 {
        mode as u8
    }
}

bitfield! {
    /// D#_CHCR. Bits 31:16 mirror the upper half of the last decoded
    /// chain tag and ignore writes.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChannelControl(pub u32): Debug, FromStorage, IntoStorage, DerefStorage {
        pub from_memory: bool @ 0,
        pub mode: u8 [try_get ChannelMode, set ChannelMode] @ 2..=3,
        pub stack_pointer: u8 @ 4..=5,
        pub tag_transfer: bool @ 6,
        pub tag_interrupt: bool @ 7,
        pub start: bool @ 8,
        pub tag_upper: u16 @ 16..=31,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRegister {
    Chcr,
    Madr,
    Qwc,
    Tadr,
    Asr0,
    Asr1,
    Sadr,
}

impl ChannelRegister {
    pub const fn name(self) -> &'static str {
        match self {
            ChannelRegister::Chcr => "CHCR",
            ChannelRegister::Madr => "MADR",
            ChannelRegister::Qwc => "QWC",
            ChannelRegister::Tadr => "TADR",
            ChannelRegister::Asr0 => "ASR0",
            ChannelRegister::Asr1 => "ASR1",
            ChannelRegister::Sadr => "SADR",
        }
    }
}

pub fn decode_register(address: u32) -> Option<(usize, ChannelRegister)> {
    for (index, base) in CHANNEL_BASES.iter().enumerate() {
        let register = match address.checked_sub(*base) {
            Some(0x00) => ChannelRegister::Chcr,
            Some(0x10) => ChannelRegister::Madr,
            Some(0x20) => ChannelRegister::Qwc,
            Some(0x30) => ChannelRegister::Tadr,
            Some(0x40) => ChannelRegister::Asr0,
            Some(0x50) => ChannelRegister::Asr1,
            Some(0x80) => ChannelRegister::Sadr,
            _ => continue,
        };
        return Some((index, register));
    }
    None
}

/// One DMA port's worth of architectural and engine-internal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub control: ChannelControl,
    pub madr: u32,
    pub qwc: u32,
    pub tadr: u32,
    pub asr: [u32; 2],
    pub sadr: u32,
    /// A decoded tag's payload is in flight.
    pub tag_active: bool,
    /// The in-flight tag was the chain's last; completion follows once
    /// QWC drains.
    pub chain_ended: bool,
    /// Hardware request line, recomputed from peer occupancy each
    /// service invocation.
    pub request: bool,
}

impl Channel {
    pub fn new(port: Port) -> Self {
        Self {
            control: ChannelControl(0),
            madr: 0,
            qwc: 0,
            tadr: 0,
            asr: [0; 2],
            sadr: 0,
            tag_active: false,
            chain_ended: false,
            request: port.default_request(),
        }
    }

    pub fn reset(&mut self, port: Port) {
        *self = Self::new(port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_word_bit_layout_is_exact() {
        let control = ChannelControl(0x0000_0145);
        assert!(control.from_memory());
        assert_eq!(control.mode(), Ok(ChannelMode::Chain));
        assert!(control.tag_transfer());
        assert!(!control.tag_interrupt());
        assert!(control.start());

        let mut control = ChannelControl(0);
        control.set_mode(ChannelMode::Interleave);
        control.set_tag_interrupt(true);
        control.set_stack_pointer(2);
        assert_eq!(control.0, (2 << 2) | (2 << 4) | (1 << 7));
    }

    #[test]
    fn reserved_mode_value_is_reported() {
        let control = ChannelControl(3 << 2);
        assert_eq!(control.mode(), Err(3));
    }

    #[test]
    fn tag_upper_occupies_the_high_half() {
        let mut control = ChannelControl(0);
        control.set_tag_upper(0xBEEF);
        assert_eq!(control.0, 0xBEEF_0000);
    }

    #[test]
    fn register_decode_handles_uneven_bases() {
        assert_eq!(decode_register(0x1000_8000), Some((0, ChannelRegister::Chcr)));
        assert_eq!(decode_register(0x1000_B430), Some((4, ChannelRegister::Tadr)));
        assert_eq!(decode_register(0x1000_D480), Some((9, ChannelRegister::Sadr)));
        assert_eq!(decode_register(0x1000_9050), Some((1, ChannelRegister::Asr1)));
        assert_eq!(decode_register(0x1000_8004), None);
        assert_eq!(decode_register(0x1000_E000), None);
    }
}
