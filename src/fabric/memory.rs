//! Word-addressed shared memory of the fabric.
//!
//! The fabric exposes two kinds of memory to software:
//!
//! - The **global store**: a large region addressable by the DMA engines
//!   (and, slowly, by the cores).
//! - One **cluster-local memory** (CLM) per cluster, all of the same size,
//!   placed at `clm_base + k * cluster_offset`.
//!
//! ```text
//! clm_base            clm_base + S        clm_base + 2S
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │    CLM 0     │... │    CLM 1     │... │    CLM 2     │ ...
//! └──────────────┘    └──────────────┘    └──────────────┘
//!
//! global_base
//! ┌────────────────────────────────────────────────────────┐
//! │                    global store                         │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! Storage is a flat array of 32-bit atomic words per region, so every core
//! thread can access memory concurrently without locks. All accesses use
//! relaxed ordering; cross-core visibility is established by the barriers,
//! exactly like on the real fabric.
//!
//! # Usage
//!
//! ```
//! use fabric_emu::fabric::memory::Memory;
//!
//! let mut mem = Memory::new();
//! mem.add_region("scratch", 0x1000, 256).unwrap();
//!
//! mem.write_f64(0x1008, 2.5).unwrap();
//! assert_eq!(mem.read_f64(0x1008).unwrap(), 2.5);
//! ```

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// Error type for memory accesses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// Address (or part of the accessed range) is not backed by any region.
    #[error("address 0x{address:010x} (+{len} bytes) is not mapped")]
    Unmapped { address: u64, len: u64 },

    /// Scalar access not aligned to its natural size.
    #[error("address 0x{address:010x} not aligned to {required} bytes")]
    Misaligned { address: u64, required: u64 },

    /// New region overlaps an existing one.
    #[error("region '{name}' at 0x{base:010x} overlaps with '{existing}'")]
    RegionOverlap { name: String, base: u64, existing: String },
}

/// A named, contiguous memory region.
#[derive(Debug)]
pub struct Region {
    /// Human-readable name (e.g. "global", "clm0").
    pub name: String,
    /// Base address of the region.
    pub base: u64,
    words: Box<[AtomicU32]>,
}

impl Region {
    fn new(name: impl Into<String>, base: u64, size: u64) -> Self {
        let n_words = size.div_ceil(4) as usize;
        Self {
            name: name.into(),
            base,
            words: (0..n_words).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Size of the region in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.words.len() as u64 * 4
    }

    /// Check if the byte range `[addr, addr + len)` falls inside this region.
    #[inline]
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        addr >= self.base && addr.saturating_add(len) <= self.base + self.size()
    }

    #[inline]
    fn overlaps(&self, base: u64, size: u64) -> bool {
        base < self.base + self.size() && base.saturating_add(size) > self.base
    }

    #[inline]
    fn word(&self, addr: u64) -> &AtomicU32 {
        &self.words[((addr - self.base) / 4) as usize]
    }
}

/// Fabric memory: the set of all regions plus access statistics.
#[derive(Debug, Default)]
pub struct Memory {
    regions: Vec<Region>,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl Memory {
    /// Create an empty memory with no regions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a zero-initialized region.
    pub fn add_region(&mut self, name: impl Into<String>, base: u64, size: u64) -> Result<(), MemoryError> {
        let name = name.into();
        if let Some(existing) = self.regions.iter().find(|r| r.overlaps(base, size)) {
            return Err(MemoryError::RegionOverlap {
                name,
                base,
                existing: existing.name.clone(),
            });
        }
        log::debug!("Memory region '{}' at 0x{:010x} ({} bytes)", name, base, size);
        self.regions.push(Region::new(name, base, size));
        Ok(())
    }

    /// Get a region by name.
    pub fn region(&self, name: &str) -> Option<&Region> {
        self.regions.iter().find(|r| r.name == name)
    }

    /// All regions in creation order.
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Find the region holding `[addr, addr + len)`.
    fn locate(&self, addr: u64, len: u64) -> Result<&Region, MemoryError> {
        self.regions
            .iter()
            .find(|r| r.contains(addr, len))
            .ok_or(MemoryError::Unmapped { address: addr, len })
    }

    #[inline]
    fn check_align(addr: u64, required: u64) -> Result<(), MemoryError> {
        if addr % required != 0 {
            return Err(MemoryError::Misaligned { address: addr, required });
        }
        Ok(())
    }

    /// Read a byte.
    pub fn read_u8(&self, addr: u64) -> Result<u8, MemoryError> {
        let word = self.locate(addr, 1)?.word(addr).load(Ordering::Relaxed);
        self.bytes_read.fetch_add(1, Ordering::Relaxed);
        Ok((word >> ((addr % 4) * 8)) as u8)
    }

    /// Write a byte.
    pub fn write_u8(&self, addr: u64, value: u8) -> Result<(), MemoryError> {
        let shift = (addr % 4) * 8;
        self.merge_word(addr, 1, 0xFF << shift, (value as u32) << shift)
    }

    /// Read a little-endian half-word.
    pub fn read_u16(&self, addr: u64) -> Result<u16, MemoryError> {
        Self::check_align(addr, 2)?;
        let word = self.locate(addr, 2)?.word(addr).load(Ordering::Relaxed);
        self.bytes_read.fetch_add(2, Ordering::Relaxed);
        Ok((word >> ((addr % 4) * 8)) as u16)
    }

    /// Write a little-endian half-word.
    pub fn write_u16(&self, addr: u64, value: u16) -> Result<(), MemoryError> {
        Self::check_align(addr, 2)?;
        let shift = (addr % 4) * 8;
        self.merge_word(addr, 2, 0xFFFF << shift, (value as u32) << shift)
    }

    /// Replace the bits selected by `mask` in the word holding `addr`.
    fn merge_word(&self, addr: u64, len: u64, mask: u32, bits: u32) -> Result<(), MemoryError> {
        let word = self.locate(addr, len)?.word(addr);
        // Sub-word stores from different cores may hit the same word, so the
        // merge must be a single read-modify-write.
        let _ = word.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |w| Some((w & !mask) | bits));
        self.bytes_written.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    /// Read a 32-bit word.
    pub fn read_u32(&self, addr: u64) -> Result<u32, MemoryError> {
        Self::check_align(addr, 4)?;
        let value = self.locate(addr, 4)?.word(addr).load(Ordering::Relaxed);
        self.bytes_read.fetch_add(4, Ordering::Relaxed);
        Ok(value)
    }

    /// Write a 32-bit word.
    pub fn write_u32(&self, addr: u64, value: u32) -> Result<(), MemoryError> {
        Self::check_align(addr, 4)?;
        self.locate(addr, 4)?.word(addr).store(value, Ordering::Relaxed);
        self.bytes_written.fetch_add(4, Ordering::Relaxed);
        Ok(())
    }

    /// Atomic fetch-and-add on a 32-bit word (AMO). Returns the old value.
    pub fn fetch_add_u32(&self, addr: u64, value: u32) -> Result<u32, MemoryError> {
        Self::check_align(addr, 4)?;
        let old = self.locate(addr, 4)?.word(addr).fetch_add(value, Ordering::Relaxed);
        self.bytes_written.fetch_add(4, Ordering::Relaxed);
        Ok(old)
    }

    /// Read a 64-bit value as two word accesses (low word first).
    pub fn read_u64(&self, addr: u64) -> Result<u64, MemoryError> {
        Self::check_align(addr, 8)?;
        let region = self.locate(addr, 8)?;
        let lo = region.word(addr).load(Ordering::Relaxed) as u64;
        let hi = region.word(addr + 4).load(Ordering::Relaxed) as u64;
        self.bytes_read.fetch_add(8, Ordering::Relaxed);
        Ok(lo | (hi << 32))
    }

    /// Write a 64-bit value as two word accesses (low word first).
    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), MemoryError> {
        Self::check_align(addr, 8)?;
        let region = self.locate(addr, 8)?;
        region.word(addr).store(value as u32, Ordering::Relaxed);
        region.word(addr + 4).store((value >> 32) as u32, Ordering::Relaxed);
        self.bytes_written.fetch_add(8, Ordering::Relaxed);
        Ok(())
    }

    /// Read a double-precision float.
    #[inline]
    pub fn read_f64(&self, addr: u64) -> Result<f64, MemoryError> {
        self.read_u64(addr).map(f64::from_bits)
    }

    /// Write a double-precision float.
    #[inline]
    pub fn write_f64(&self, addr: u64, value: f64) -> Result<(), MemoryError> {
        self.write_u64(addr, value.to_bits())
    }

    /// Read a single-precision float.
    #[inline]
    pub fn read_f32(&self, addr: u64) -> Result<f32, MemoryError> {
        self.read_u32(addr).map(f32::from_bits)
    }

    /// Write a single-precision float.
    #[inline]
    pub fn write_f32(&self, addr: u64, value: f32) -> Result<(), MemoryError> {
        self.write_u32(addr, value.to_bits())
    }

    /// Read bytes starting at `addr` into `buf`. Any alignment is accepted.
    pub fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let region = self.locate(addr, buf.len() as u64)?;
        let mut cursor = addr;
        let mut filled = 0;
        while filled < buf.len() {
            let word_addr = cursor & !3;
            let skip = (cursor - word_addr) as usize;
            let mut bytes = [0u8; 4];
            LittleEndian::write_u32(&mut bytes, region.word(word_addr).load(Ordering::Relaxed));
            let take = (4 - skip).min(buf.len() - filled);
            buf[filled..filled + take].copy_from_slice(&bytes[skip..skip + take]);
            filled += take;
            cursor += take as u64;
        }
        self.bytes_read.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Write `data` starting at `addr`. Any alignment is accepted.
    pub fn write_bytes(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        let region = self.locate(addr, data.len() as u64)?;
        let mut cursor = addr;
        let mut done = 0;
        while done < data.len() {
            let word_addr = cursor & !3;
            let skip = (cursor - word_addr) as usize;
            let take = (4 - skip).min(data.len() - done);
            let word = region.word(word_addr);
            if take == 4 {
                word.store(LittleEndian::read_u32(&data[done..done + 4]), Ordering::Relaxed);
            } else {
                let mut patch = [0u8; 4];
                let mut mask = [0u8; 4];
                patch[skip..skip + take].copy_from_slice(&data[done..done + take]);
                mask[skip..skip + take].fill(0xFF);
                let bits = LittleEndian::read_u32(&patch);
                let mask = LittleEndian::read_u32(&mask);
                let _ = word.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |w| Some((w & !mask) | bits));
            }
            done += take;
            cursor += take as u64;
        }
        self.bytes_written.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Copy `len` bytes from `src` to `dst` in ascending address order.
    ///
    /// Word-aligned copies move whole words; anything else goes through a
    /// bounce buffer.
    pub fn copy(&self, dst: u64, src: u64, len: u64) -> Result<(), MemoryError> {
        if len == 0 {
            return Ok(());
        }
        let src_region = self.locate(src, len)?;
        let dst_region = self.locate(dst, len)?;
        if src % 4 == 0 && dst % 4 == 0 && len % 4 == 0 {
            for offset in (0..len).step_by(4) {
                let value = src_region.word(src + offset).load(Ordering::Relaxed);
                dst_region.word(dst + offset).store(value, Ordering::Relaxed);
            }
            self.bytes_read.fetch_add(len, Ordering::Relaxed);
            self.bytes_written.fetch_add(len, Ordering::Relaxed);
            return Ok(());
        }
        let mut buf = vec![0u8; len as usize];
        self.read_bytes(src, &mut buf)?;
        self.write_bytes(dst, &buf)
    }

    /// Fill `len` bytes at `addr` with `value`.
    pub fn fill(&self, addr: u64, value: u8, len: u64) -> Result<(), MemoryError> {
        self.write_bytes(addr, &vec![value; len as usize])
    }

    /// Read `count` consecutive doubles.
    pub fn read_f64s(&self, addr: u64, count: usize) -> Result<Vec<f64>, MemoryError> {
        (0..count).map(|i| self.read_f64(addr + 8 * i as u64)).collect()
    }

    /// Write consecutive doubles.
    pub fn write_f64s(&self, addr: u64, values: &[f64]) -> Result<(), MemoryError> {
        for (i, v) in values.iter().enumerate() {
            self.write_f64(addr + 8 * i as u64, *v)?;
        }
        Ok(())
    }

    /// Read `count` consecutive 32-bit words.
    pub fn read_u32s(&self, addr: u64, count: usize) -> Result<Vec<u32>, MemoryError> {
        (0..count).map(|i| self.read_u32(addr + 4 * i as u64)).collect()
    }

    /// Write consecutive 32-bit words.
    pub fn write_u32s(&self, addr: u64, values: &[u32]) -> Result<(), MemoryError> {
        for (i, v) in values.iter().enumerate() {
            self.write_u32(addr + 4 * i as u64, *v)?;
        }
        Ok(())
    }

    /// Total bytes read since creation.
    pub fn total_bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Total bytes written since creation.
    pub fn total_bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}
