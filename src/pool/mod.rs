//! Virtual address pool
//!
//! The pool draws uniformly-distributed IPv4 addresses from an inclusive
//! range. It keeps no memory of prior draws; uniqueness is enforced by the
//! mapping store through its retry-on-collision loop, which keeps the pool
//! stateless and allocation O(1).

use std::net::{IpAddr, Ipv4Addr};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::PoolError;

/// Source of candidate virtual addresses.
///
/// Implementations must be safe to share across concurrent callers.
pub trait AddressPool: Send + Sync {
    /// Draw a uniformly-distributed address from the pool's range.
    fn get_random(&self) -> Ipv4Addr;
}

/// Uniform random pool over an inclusive IPv4 range.
#[derive(Debug)]
pub struct RandomPool {
    base: u32,
    size: u64,
    rng: Mutex<StdRng>,
}

impl RandomPool {
    /// Create a pool over `[start, end]`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::UnsupportedAddressFamily`] if either endpoint is
    /// not IPv4, or [`PoolError::BadOrder`] if `end < start`.
    pub fn new(start: IpAddr, end: IpAddr) -> Result<Self, PoolError> {
        let (IpAddr::V4(start), IpAddr::V4(end)) = (start, end) else {
            return Err(PoolError::UnsupportedAddressFamily);
        };
        let base = u32::from(start);
        let last = u32::from(end);
        if last < base {
            return Err(PoolError::BadOrder);
        }

        Ok(Self {
            base,
            // u64 so a full 0.0.0.0-255.255.255.255 range does not overflow
            size: u64::from(last) - u64::from(base) + 1,
            rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    /// Number of addresses in the range.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Check whether an address falls inside the range.
    #[must_use]
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let value = u64::from(u32::from(addr));
        let base = u64::from(self.base);
        value >= base && value < base + self.size
    }
}

impl AddressPool for RandomPool {
    #[allow(clippy::cast_possible_truncation)] // offset < size <= 2^32
    fn get_random(&self) -> Ipv4Addr {
        let offset = self.rng.lock().gen_range(0..self.size);
        Ipv4Addr::from(self.base + offset as u32)
    }
}
