//! Register-level front end of the DMA engine.
//!
//! | Instruction      | Effect                                           |
//! |------------------|--------------------------------------------------|
//! | `dmsrc lo, hi`   | source address register                          |
//! | `dmdst lo, hi`   | destination address register                     |
//! | `dmstr dst, src` | line strides                                     |
//! | `dmrep n`        | line count for 2D transfers                      |
//! | `dmcpy size,cfg` | launch; returns the transfer id                  |
//! | `dmstati sel`    | status query                                     |
//!
//! The configuration word is `channel << 2 | is_2d << 1`.

use super::{DmaError, TransferKind, TransferRequest};

/// Bit selecting a 2D transfer in the configuration word.
pub const CFG_2D: u32 = 1 << 1;
/// Shift of the channel field in the configuration word.
pub const CFG_CHANNEL_SHIFT: u32 = 2;

/// Status selector: id of the last completed transfer.
pub const STAT_COMPLETED_ID: u32 = 0;
/// Status selector: start performance tracking.
pub const STAT_START_TRACKING: u32 = 1;
/// Status selector: busy flag.
pub const STAT_BUSY: u32 = 2;
/// Status selector: stop performance tracking.
pub const STAT_STOP_TRACKING: u32 = 3;

/// Encode a configuration word.
#[inline]
pub fn config_word(kind: TransferKind, channel: u32) -> u32 {
    let shape = match kind {
        TransferKind::OneD => 0,
        TransferKind::TwoD => CFG_2D,
    };
    channel << CFG_CHANNEL_SHIFT | shape
}

/// Decode a configuration word into shape and channel.
#[inline]
pub fn decode_config(config: u32) -> (TransferKind, u32) {
    let kind = if config & CFG_2D != 0 {
        TransferKind::TwoD
    } else {
        TransferKind::OneD
    };
    (kind, config >> CFG_CHANNEL_SHIFT)
}

/// Split a 64-bit address into the low and high register halves.
#[inline]
pub fn split_address(addr: u64) -> (u32, u32) {
    (addr as u32, (addr >> 32) as u32)
}

/// Status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSelector {
    CompletedId,
    StartTracking,
    Busy,
    StopTracking,
}

impl TryFrom<u32> for StatusSelector {
    type Error = DmaError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            STAT_COMPLETED_ID => Ok(Self::CompletedId),
            STAT_START_TRACKING => Ok(Self::StartTracking),
            STAT_BUSY => Ok(Self::Busy),
            STAT_STOP_TRACKING => Ok(Self::StopTracking),
            other => Err(DmaError::InvalidStatusSelector(other)),
        }
    }
}

/// Architectural DMA registers of one DMA core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DmaRegisters {
    src: u64,
    dst: u64,
    src_stride: u64,
    dst_stride: u64,
    repeat: u64,
}

impl DmaRegisters {
    pub fn dmsrc(&mut self, lo: u32, hi: u32) {
        self.src = (hi as u64) << 32 | lo as u64;
    }

    pub fn dmdst(&mut self, lo: u32, hi: u32) {
        self.dst = (hi as u64) << 32 | lo as u64;
    }

    pub fn dmstr(&mut self, dst_stride: u64, src_stride: u64) {
        self.dst_stride = dst_stride;
        self.src_stride = src_stride;
    }

    pub fn dmrep(&mut self, repeat: u64) {
        self.repeat = repeat;
    }

    /// Build the request a `dmcpy` with these registers would launch.
    pub fn request(&self, size: u64, config: u32) -> TransferRequest {
        let (kind, channel) = decode_config(config);
        let (src_stride, dst_stride, repeat) = match kind {
            TransferKind::OneD => (0, 0, 1),
            TransferKind::TwoD => (self.src_stride, self.dst_stride, self.repeat),
        };
        TransferRequest {
            kind,
            channel,
            src: self.src,
            dst: self.dst,
            size,
            src_stride,
            dst_stride,
            repeat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_word_layout() {
        assert_eq!(config_word(TransferKind::OneD, 0), 0);
        assert_eq!(config_word(TransferKind::TwoD, 0), 2);
        assert_eq!(config_word(TransferKind::TwoD, 3), 0b1110);
        assert_eq!(decode_config(0b1110), (TransferKind::TwoD, 3));
        assert_eq!(decode_config(0b0100), (TransferKind::OneD, 1));
    }

    #[test]
    fn test_registers_build_request() {
        let mut regs = DmaRegisters::default();
        let (lo, hi) = split_address(0x1_2345_6780);
        regs.dmsrc(lo, hi);
        regs.dmdst(0x1000, 0);
        regs.dmstr(64, 128);
        regs.dmrep(4);

        let req = regs.request(32, config_word(TransferKind::TwoD, 1));
        assert_eq!(req.src, 0x1_2345_6780);
        assert_eq!(req.dst, 0x1000);
        assert_eq!((req.dst_stride, req.src_stride, req.repeat), (64, 128, 4));
        assert_eq!(req.channel, 1);
        assert_eq!(req.total_bytes(), 128);

        // 1D ignores stride and repeat registers
        let req = regs.request(32, 0);
        assert_eq!((req.repeat, req.src_stride), (1, 0));
    }

    #[test]
    fn test_status_selector_decode() {
        assert_eq!(StatusSelector::try_from(2), Ok(StatusSelector::Busy));
        assert_eq!(StatusSelector::try_from(4), Err(DmaError::InvalidStatusSelector(4)));
    }
}
