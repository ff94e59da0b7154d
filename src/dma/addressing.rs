//! Multi-dimensional address generation.
//!
//! Used for the line starts of 2D bulk transfers and for the operand
//! streams of compute cores. Each dimension has a size (number of
//! iterations) and a stride (byte increment per iteration).
//!
//! # Address Generation
//!
//! For a 2D stream with:
//! - Base address: 0x1000
//! - D0: size=4, stride=8 (4 doubles)
//! - D1: size=3, stride=64 (3 rows, 64 bytes between row starts)
//!
//! Generated addresses:
//! ```text
//! Row 0: 0x1000, 0x1008, 0x1010, 0x1018
//! Row 1: 0x1040, 0x1048, 0x1050, 0x1058
//! Row 2: 0x1080, 0x1088, 0x1090, 0x1098
//! ```
//!
//! A stride of 0 repeats the same addresses, which is how a row of A is
//! re-read for every column of B in a matrix product.

/// Maximum number of dimensions.
pub const MAX_DIMS: usize = 4;

/// Configuration for a single dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DimensionConfig {
    /// Number of iterations (0 means disabled, treated as 1 iteration).
    pub size: u32,

    /// Address increment in bytes per iteration (may be negative).
    pub stride: i64,
}

impl DimensionConfig {
    pub fn new(size: u32, stride: i64) -> Self {
        Self { size, stride }
    }

    /// Get effective size (0 = 1 iteration)
    #[inline]
    pub fn effective_size(&self) -> u32 {
        self.size.max(1)
    }
}

/// Multi-dimensional address generator.
///
/// The address is computed as
/// `base + d0_counter * d0_stride + d1_counter * d1_stride + ...`
/// with D0 innermost.
#[derive(Debug, Clone)]
pub struct AddressGenerator {
    base: u64,
    dimensions: [DimensionConfig; MAX_DIMS],
    counters: [u32; MAX_DIMS],
    total_elements: u64,
    elements_generated: u64,
}

impl AddressGenerator {
    /// Create a generator for a 1D sequence.
    pub fn new_1d(base: u64, count: u32, stride: i64) -> Self {
        Self::from_dims(base, &[DimensionConfig::new(count, stride)])
    }

    /// Create a generator for a 2D sequence.
    pub fn new_2d(base: u64, d0_size: u32, d0_stride: i64, d1_size: u32, d1_stride: i64) -> Self {
        Self::from_dims(
            base,
            &[
                DimensionConfig::new(d0_size, d0_stride),
                DimensionConfig::new(d1_size, d1_stride),
            ],
        )
    }

    /// Create a generator from up to [`MAX_DIMS`] dimensions, innermost first.
    ///
    /// Extra dimensions beyond [`MAX_DIMS`] are ignored.
    pub fn from_dims(base: u64, dims: &[DimensionConfig]) -> Self {
        let mut dimensions = [DimensionConfig::default(); MAX_DIMS];
        for (slot, dim) in dimensions.iter_mut().zip(dims) {
            *slot = *dim;
        }
        Self::new(base, dimensions)
    }

    pub fn new(base: u64, dimensions: [DimensionConfig; MAX_DIMS]) -> Self {
        let total_elements = dimensions.iter().map(|d| d.effective_size() as u64).product();
        Self {
            base,
            dimensions,
            counters: [0; MAX_DIMS],
            total_elements,
            elements_generated: 0,
        }
    }

    fn compute_address(&self) -> u64 {
        let offset: i64 = self
            .counters
            .iter()
            .zip(&self.dimensions)
            .map(|(&c, d)| c as i64 * d.stride)
            .sum();
        self.base.wrapping_add_signed(offset)
    }

    /// The address the next call to [`Self::next`] returns.
    #[inline]
    pub fn current(&self) -> u64 {
        self.compute_address()
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.elements_generated >= self.total_elements
    }

    #[inline]
    pub fn total_elements(&self) -> u64 {
        self.total_elements
    }

    #[inline]
    pub fn remaining(&self) -> u64 {
        self.total_elements - self.elements_generated
    }

    /// Advance to the next address.
    ///
    /// Returns the next address, or None if finished.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<u64> {
        if self.is_finished() {
            return None;
        }
        let addr = self.compute_address();
        self.elements_generated += 1;
        self.advance();
        Some(addr)
    }

    fn advance(&mut self) {
        for dim in 0..MAX_DIMS {
            self.counters[dim] += 1;
            if self.counters[dim] < self.dimensions[dim].effective_size() {
                return;
            }
            self.counters[dim] = 0;
        }
    }

    /// Reset to the beginning.
    pub fn reset(&mut self) {
        self.counters = [0; MAX_DIMS];
        self.elements_generated = 0;
    }

    /// Iterate over all remaining addresses without consuming this generator.
    pub fn iter(&self) -> AddressIterator {
        AddressIterator {
            generator: self.clone(),
        }
    }
}

/// Iterator over addresses generated by an [`AddressGenerator`].
pub struct AddressIterator {
    generator: AddressGenerator,
}

impl Iterator for AddressIterator {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        self.generator.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.generator.remaining() as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for AddressIterator {}
