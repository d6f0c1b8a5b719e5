use thiserror::Error;

/// Hard stops for the emulated session. The engines never guess a
/// continuation: anything outside the documented register, mode, and tag
/// tables surfaces here and the host decides whether to halt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DmaError {
    #[error("{register}: unsupported {width}-bit access")]
    UnsupportedAccess { register: &'static str, width: u8 },

    #[error("channel {channel} {register}: unsupported {width}-bit access")]
    UnsupportedChannelAccess {
        channel: usize,
        register: &'static str,
        width: u8,
    },

    #[error("channel {channel} has no {register} register")]
    MissingRegister {
        channel: usize,
        register: &'static str,
    },

    #[error("unmapped DMA register at {address:#010X} ({width}-bit)")]
    UnmappedRegister { address: u32, width: u8 },

    #[error("{register} is read-only")]
    ReadOnlyRegister { register: &'static str },

    #[error("channel {channel}: CHCR mode field holds reserved value {mode}")]
    ReservedMode { channel: usize, mode: u8 },

    #[error("channel {channel}: {mode} mode is not implemented")]
    UnmodeledMode { channel: usize, mode: &'static str },

    #[error("channel {channel} ({name}): no modeled peer for this port")]
    UnmodeledChannel { channel: usize, name: &'static str },

    #[error("channel {channel}: {id} tag is recognized but not implemented (tag {tag:#018X})")]
    UnimplementedTag {
        channel: usize,
        id: &'static str,
        tag: u64,
    },

    #[error("channel {channel}: undocumented tag id {id} (tag {tag:#018X})")]
    UnknownTag { channel: usize, id: u8, tag: u64 },

    #[error("channel {channel}: tag transfer enabled but {peer} does not accept inline tags")]
    TagTransferUnsupported { channel: usize, peer: &'static str },

    #[error("channel {channel}: {fifo} FIFO overflow")]
    FifoOverflow { channel: usize, fifo: &'static str },

    #[error("channel {channel}: {fifo} FIFO underflow")]
    FifoUnderflow { channel: usize, fifo: &'static str },
}
