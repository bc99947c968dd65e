//! SPI allocation.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::error::{Error, Result};
use super::ext::SpiRangeExt;
use super::message::IpsecProtocol;
use super::sadb::Sadb;

/// Largest compression parameter index.
const CPI_MAX: u32 = 0xffff;

/// Allocation statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpiStats {
    /// Successful allocations.
    pub allocations: u64,
    /// Running average of draws per allocation.
    pub average_attempts: u32,
}

/// Random SPI allocator.
#[derive(Debug)]
pub struct SpiAllocator {
    rng: StdRng,
    min: u32,
    max: u32,
    trycnt: u32,
    stats: SpiStats,
}

impl SpiAllocator {
    /// Create an allocator seeded from OS entropy.
    pub fn new(min: u32, max: u32, trycnt: u32) -> Self {
        Self::from_rng(StdRng::from_entropy(), min, max, trycnt)
    }

    /// Create an allocator with a fixed seed.
    pub fn with_seed(seed: u64, min: u32, max: u32, trycnt: u32) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed), min, max, trycnt)
    }

    fn from_rng(rng: StdRng, min: u32, max: u32, trycnt: u32) -> Self {
        Self {
            rng,
            min,
            max,
            trycnt,
            stats: SpiStats::default(),
        }
    }

    /// Reseed from OS entropy.
    pub fn reseed(&mut self) {
        self.rng = StdRng::from_entropy();
    }

    pub fn stats(&self) -> SpiStats {
        self.stats
    }

    fn record(&mut self, attempts: u32) {
        self.stats.allocations += 1;
        self.stats.average_attempts = (self.stats.average_attempts + attempts) / 2;
    }

    /// Pick an SPI for a new inbound SA of `protocol`.
    ///
    /// A single-value range is taken as a forced SPI and fails with
    /// `Exists` when it is in use. Otherwise up to `trycnt` random draws
    /// are made from the range.
    pub fn allocate(
        &mut self,
        range: Option<&SpiRangeExt>,
        protocol: IpsecProtocol,
        sadb: &Sadb,
    ) -> Result<u32> {
        let (mut min, mut max) = range.map_or((self.min, self.max), |r| (r.min, r.max));
        if protocol == IpsecProtocol::IpComp {
            min = min.clamp(1, CPI_MAX);
            max = max.clamp(1, CPI_MAX);
            if min > max {
                std::mem::swap(&mut min, &mut max);
            }
        }
        if min > max {
            return Err(Error::malformed(format!("SPI range {min:#x}..={max:#x} is empty")));
        }

        if min == max {
            if min == 0 || sadb.spi_in_use(protocol, min) {
                debug!(spi = format_args!("{:#x}", min), "requested SPI already in use");
                return Err(Error::exists(format!("SPI {min:#x}")));
            }
            self.record(1);
            return Ok(min);
        }

        for attempt in 1..=self.trycnt {
            let spi = self.rng.gen_range(min..=max);
            if spi != 0 && !sadb.spi_in_use(protocol, spi) {
                self.record(attempt);
                return Ok(spi);
            }
        }
        debug!(min, max, attempts = self.trycnt, "SPI allocation failed");
        Err(Error::NoSpiAvailable {
            attempts: self.trycnt,
        })
    }
}
