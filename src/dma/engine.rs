//! Per-cluster DMA engine.
//!
//! The engine has a fixed number of channels. Each channel is a FIFO of
//! issued transfers of which only the head is in flight. One call to
//! [`DmaEngine::step`] moves at most `bus_width` bytes on every busy
//! channel, so transfers on different channels progress concurrently and
//! may complete out of issue order.
//!
//! # Completion Tracking
//!
//! Ids are issued in increasing order. The engine keeps a watermark (every
//! id up to it has completed) plus the set of ids that completed early on
//! another channel. The watermark is what `dmstati 0` reports.
//!
//! # Usage
//!
//! ```
//! use fabric_emu::dma::engine::DmaEngine;
//! use fabric_emu::dma::{TransferKind, TransferRequest};
//! use fabric_emu::fabric::memory::Memory;
//!
//! let mut memory = Memory::new();
//! memory.add_region("l1", 0x1000, 0x1000).unwrap();
//! memory.write_u32(0x1000, 42).unwrap();
//!
//! let mut engine = DmaEngine::new(0, 2, 64);
//! let id = engine
//!     .issue(TransferRequest {
//!         kind: TransferKind::OneD,
//!         channel: 0,
//!         src: 0x1000,
//!         dst: 0x1800,
//!         size: 4,
//!         src_stride: 0,
//!         dst_stride: 0,
//!         repeat: 1,
//!     })
//!     .unwrap();
//! engine.wait(id, &memory).unwrap();
//! assert_eq!(memory.read_u32(0x1800).unwrap(), 42);
//! ```

use std::collections::{BTreeSet, VecDeque};

use super::addressing::AddressGenerator;
use super::isa::StatusSelector;
use super::{DmaError, DmaResult, TransferId, TransferRequest};
use crate::fabric::memory::Memory;

/// Lifecycle of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Queued behind another transfer on its channel.
    Pending,
    /// Moving data.
    InFlight,
    /// All lines copied.
    Complete,
}

/// Statistics for a DMA channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Total transfers completed
    pub transfers_completed: u64,
    /// Total bytes transferred
    pub bytes_transferred: u64,
    /// Engine steps in which this channel moved data
    pub active_steps: u64,
}

/// A transfer at the head of its channel.
#[derive(Debug, Clone)]
struct ActiveTransfer {
    id: TransferId,
    request: TransferRequest,
    src_lines: AddressGenerator,
    dst_lines: AddressGenerator,
    src_line: u64,
    dst_line: u64,
    offset: u64,
    state: TransferState,
}

impl ActiveTransfer {
    fn start(id: TransferId, request: TransferRequest) -> Option<Self> {
        if request.repeat == 0 || request.size == 0 {
            return None;
        }
        // Bounded at issue time.
        let lines = u32::try_from(request.repeat).ok()?;
        let mut src_lines = AddressGenerator::new_1d(request.src, lines, request.src_stride as i64);
        let mut dst_lines = AddressGenerator::new_1d(request.dst, lines, request.dst_stride as i64);
        let src_line = src_lines.next()?;
        let dst_line = dst_lines.next()?;
        Some(Self {
            id,
            request,
            src_lines,
            dst_lines,
            src_line,
            dst_line,
            offset: 0,
            state: TransferState::InFlight,
        })
    }

    /// Move up to `budget` bytes. Returns the bytes moved.
    fn advance(&mut self, memory: &Memory, budget: u64) -> DmaResult<u64> {
        let chunk = budget.min(self.request.size - self.offset);
        memory
            .copy(self.dst_line + self.offset, self.src_line + self.offset, chunk)
            .map_err(|source| DmaError::Memory { id: self.id, source })?;
        self.offset += chunk;
        if self.offset == self.request.size {
            match (self.src_lines.next(), self.dst_lines.next()) {
                (Some(src), Some(dst)) => {
                    self.src_line = src;
                    self.dst_line = dst;
                    self.offset = 0;
                }
                _ => self.state = TransferState::Complete,
            }
        }
        Ok(chunk)
    }
}

/// DMA engine of one cluster.
#[derive(Debug)]
pub struct DmaEngine {
    cluster: usize,
    bus_width: u64,
    queues: Vec<VecDeque<(TransferId, TransferRequest)>>,
    active: Vec<Option<ActiveTransfer>>,
    next_id: TransferId,
    completed_id: TransferId,
    completed_ahead: BTreeSet<TransferId>,
    tracking: bool,
    stats: Vec<ChannelStats>,
}

impl DmaEngine {
    /// Create an engine with `channels` channels moving `bus_width` bytes per step.
    pub fn new(cluster: usize, channels: u32, bus_width: u64) -> Self {
        let channels = channels as usize;
        Self {
            cluster,
            bus_width,
            queues: vec![VecDeque::new(); channels],
            active: vec![None; channels],
            next_id: 1,
            completed_id: 0,
            completed_ahead: BTreeSet::new(),
            tracking: false,
            stats: vec![ChannelStats::default(); channels],
        }
    }

    /// Number of channels.
    pub fn num_channels(&self) -> u32 {
        self.queues.len() as u32
    }

    /// Queue a transfer and return its id.
    pub fn issue(&mut self, request: TransferRequest) -> DmaResult<TransferId> {
        let channels = self.num_channels();
        if request.channel >= channels {
            return Err(DmaError::InvalidChannel {
                channel: request.channel,
                channels,
            });
        }
        if u32::try_from(request.repeat).is_err() {
            return Err(DmaError::RepeatOverflow(request.repeat));
        }
        let id = self.next_id;
        self.next_id += 1;
        log::trace!(
            "DMA{} ch{}: #{} {:?} 0x{:x} -> 0x{:x}, {} x {} bytes",
            self.cluster,
            request.channel,
            id,
            request.kind,
            request.src,
            request.dst,
            request.repeat,
            request.size
        );
        self.queues[request.channel as usize].push_back((id, request));
        Ok(id)
    }

    /// Whether any transfer is pending or in flight.
    pub fn is_busy(&self) -> bool {
        self.active.iter().any(Option::is_some) || self.queues.iter().any(|q| !q.is_empty())
    }

    /// Highest id such that it and every earlier id completed.
    pub fn completed_id(&self) -> TransferId {
        self.completed_id
    }

    /// Whether transfer `id` completed.
    pub fn is_complete(&self, id: TransferId) -> bool {
        id <= self.completed_id || self.completed_ahead.contains(&id)
    }

    /// State of an issued transfer.
    pub fn state(&self, id: TransferId) -> Option<TransferState> {
        if id == 0 || id >= self.next_id {
            return None;
        }
        if self.is_complete(id) {
            return Some(TransferState::Complete);
        }
        if self.active.iter().flatten().any(|t| t.id == id) {
            return Some(TransferState::InFlight);
        }
        Some(TransferState::Pending)
    }

    /// Statistics per channel.
    pub fn stats(&self) -> &[ChannelStats] {
        &self.stats
    }

    fn mark_complete(&mut self, id: TransferId) {
        if id == self.completed_id + 1 {
            self.completed_id = id;
            while self.completed_ahead.remove(&(self.completed_id + 1)) {
                self.completed_id += 1;
            }
        } else {
            self.completed_ahead.insert(id);
        }
    }

    /// Advance every channel by one bus beat. Returns whether still busy.
    ///
    /// A transfer that faults is retired so later waits do not spin on it.
    pub fn step(&mut self, memory: &Memory) -> DmaResult<bool> {
        for ch in 0..self.queues.len() {
            while self.active[ch].is_none() {
                let Some((id, request)) = self.queues[ch].pop_front() else {
                    break;
                };
                match ActiveTransfer::start(id, request) {
                    Some(transfer) => self.active[ch] = Some(transfer),
                    None => {
                        self.stats[ch].transfers_completed += 1;
                        self.mark_complete(id);
                    }
                }
            }

            let Some(transfer) = self.active[ch].as_mut() else {
                continue;
            };
            let id = transfer.id;
            match transfer.advance(memory, self.bus_width) {
                Ok(moved) => {
                    self.stats[ch].bytes_transferred += moved;
                    self.stats[ch].active_steps += 1;
                    if transfer.state == TransferState::Complete {
                        self.active[ch] = None;
                        self.stats[ch].transfers_completed += 1;
                        self.mark_complete(id);
                    }
                }
                Err(e) => {
                    log::warn!("DMA{} ch{}: {}", self.cluster, ch, e);
                    self.active[ch] = None;
                    self.mark_complete(id);
                    return Err(e);
                }
            }
        }
        Ok(self.is_busy())
    }

    /// Answer a status query.
    pub fn status(&mut self, selector: StatusSelector) -> u32 {
        match selector {
            StatusSelector::CompletedId => self.completed_id,
            StatusSelector::Busy => u32::from(self.is_busy()),
            StatusSelector::StartTracking => {
                self.tracking = true;
                log::debug!("DMA{}: tracking started at #{}", self.cluster, self.completed_id);
                0
            }
            StatusSelector::StopTracking => {
                self.tracking = false;
                log::debug!("DMA{}: tracking stopped, stats {:?}", self.cluster, self.stats);
                0
            }
        }
    }

    /// Whether performance tracking is on.
    pub fn is_tracking(&self) -> bool {
        self.tracking
    }

    /// Step until transfer `id` and every earlier one complete, that is
    /// until the completed-id watermark reaches `id`.
    pub fn wait(&mut self, id: TransferId, memory: &Memory) -> DmaResult<()> {
        if id == 0 || id >= self.next_id {
            return Err(DmaError::UnknownTransfer(id));
        }
        while self.completed_id < id {
            self.step(memory)?;
        }
        Ok(())
    }

    /// Step until every issued transfer completes.
    pub fn wait_all(&mut self, memory: &Memory) -> DmaResult<()> {
        while self.is_busy() {
            self.step(memory)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::TransferKind;

    fn memory() -> Memory {
        let mut m = Memory::new();
        m.add_region("a", 0x1000, 0x1000).unwrap();
        m.add_region("b", 0x8000, 0x1000).unwrap();
        m
    }

    fn request_1d(src: u64, dst: u64, size: u64, channel: u32) -> TransferRequest {
        TransferRequest {
            kind: TransferKind::OneD,
            channel,
            src,
            dst,
            size,
            src_stride: 0,
            dst_stride: 0,
            repeat: 1,
        }
    }

    #[test]
    fn test_step_moves_one_beat() {
        let mem = memory();
        let mut engine = DmaEngine::new(0, 1, 64);
        let id = engine.issue(request_1d(0x1000, 0x8000, 256, 0)).unwrap();
        assert_eq!(engine.state(id), Some(TransferState::Pending));
        assert!(engine.step(&mem).unwrap());
        assert_eq!(engine.state(id), Some(TransferState::InFlight));
        assert_eq!(engine.stats()[0].bytes_transferred, 64);
        engine.wait(id, &mem).unwrap();
        assert_eq!(engine.stats()[0].bytes_transferred, 256);
        assert_eq!(engine.stats()[0].active_steps, 4);
        assert!(!engine.is_busy());
    }

    #[test]
    fn test_2d_transfer_strides() {
        let mem = memory();
        for r in 0..4u64 {
            mem.write_u32(0x1000 + r * 32, r as u32 + 10).unwrap();
        }
        let mut engine = DmaEngine::new(0, 1, 64);
        let id = engine
            .issue(TransferRequest {
                kind: TransferKind::TwoD,
                channel: 0,
                src: 0x1000,
                dst: 0x8000,
                size: 4,
                src_stride: 32,
                dst_stride: 4,
                repeat: 4,
            })
            .unwrap();
        engine.wait(id, &mem).unwrap();
        assert_eq!(mem.read_u32s(0x8000, 4).unwrap(), vec![10, 11, 12, 13]);
    }

    #[test]
    fn test_out_of_order_completion_watermark() {
        let mem = memory();
        let words: Vec<u32> = (0..128).collect();
        mem.write_u32s(0x1000, &words).unwrap();
        let mut engine = DmaEngine::new(0, 2, 64);
        let big = engine.issue(request_1d(0x1000, 0x8000, 512, 0)).unwrap();
        let small = engine.issue(request_1d(0x1200, 0x8200, 8, 1)).unwrap();

        // The short transfer finishes first on its own channel
        engine.step(&mem).unwrap();
        assert!(engine.is_complete(small));
        assert!(!engine.is_complete(big));
        assert_eq!(engine.state(small), Some(TransferState::Complete));
        assert_eq!(engine.state(big), Some(TransferState::InFlight));
        // Watermark stays behind the unfinished earlier transfer
        assert_eq!(engine.status(StatusSelector::CompletedId), 0);

        // Waiting on the later id also waits for the earlier one
        engine.wait(small, &mem).unwrap();
        assert!(engine.is_complete(big));
        assert_eq!(engine.completed_id(), 2);
        assert_eq!(mem.read_u32s(0x8000, 128).unwrap(), (0..128).collect::<Vec<u32>>());
    }

    #[test]
    fn test_repeat_beyond_line_counter_is_rejected() {
        let mut engine = DmaEngine::new(0, 1, 64);
        let request = TransferRequest {
            repeat: u64::from(u32::MAX) + 1,
            ..request_1d(0x1000, 0x8000, 4, 0)
        };
        assert_eq!(engine.issue(request), Err(DmaError::RepeatOverflow(u64::from(u32::MAX) + 1)));
        assert!(!engine.is_busy());
    }

    #[test]
    fn test_same_channel_is_fifo() {
        let mem = memory();
        let mut engine = DmaEngine::new(0, 1, 8);
        let first = engine.issue(request_1d(0x1000, 0x8000, 64, 0)).unwrap();
        let second = engine.issue(request_1d(0x1040, 0x8040, 8, 0)).unwrap();
        engine.wait(second, &mem).unwrap();
        assert!(engine.is_complete(first));
    }

    #[test]
    fn test_errors() {
        let mem = memory();
        let mut engine = DmaEngine::new(3, 2, 64);
        assert!(matches!(
            engine.issue(request_1d(0x1000, 0x8000, 4, 2)),
            Err(DmaError::InvalidChannel { channel: 2, channels: 2 })
        ));
        assert_eq!(engine.wait(7, &mem), Err(DmaError::UnknownTransfer(7)));

        let id = engine.issue(request_1d(0x1000, 0x5000, 4, 0)).unwrap();
        assert!(matches!(engine.wait(id, &mem), Err(DmaError::Memory { .. })));
        // The faulting transfer is retired
        assert!(!engine.is_busy());
        assert!(engine.is_complete(id));
    }

    #[test]
    fn test_empty_transfer_completes() {
        let mem = memory();
        let mut engine = DmaEngine::new(0, 1, 64);
        let id = engine.issue(request_1d(0x1000, 0x8000, 0, 0)).unwrap();
        engine.wait(id, &mem).unwrap();
        assert_eq!(engine.stats()[0].transfers_completed, 1);
    }

    #[test]
    fn test_tracking_and_busy_status() {
        let mem = memory();
        let mut engine = DmaEngine::new(0, 1, 64);
        assert_eq!(engine.status(StatusSelector::StartTracking), 0);
        assert!(engine.is_tracking());
        engine.issue(request_1d(0x1000, 0x8000, 128, 0)).unwrap();
        assert_eq!(engine.status(StatusSelector::Busy), 1);
        engine.wait_all(&mem).unwrap();
        assert_eq!(engine.status(StatusSelector::Busy), 0);
        engine.status(StatusSelector::StopTracking);
        assert!(!engine.is_tracking());
    }
}
