use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// Default first port handed out when no window is configured
pub const DEFAULT_BASE_PORT: u16 = 20000;

/// Default number of ports reserved for each parallel test node
pub const DEFAULT_PORTS_PER_NODE: u16 = 1000;

/// Hands out disjoint, consecutive port ranges for one harness process.
///
/// Every claim is a single atomic reservation on the next-free counter, so
/// concurrent callers can never receive overlapping ranges. Ports are never
/// returned to the pool; they are released implicitly when the processes that
/// bound them exit.
#[derive(Debug)]
pub struct PortAllocator {
    /// Next unclaimed port, widened so `end` itself can be represented
    next: AtomicU32,
    /// One past the last usable port
    end: u32,
}

impl PortAllocator {
    /// Creates an allocator over `[start, end)`.
    ///
    /// # Arguments
    /// * `start` - First usable port
    /// * `end` - One past the last usable port
    ///
    /// # Returns
    /// * `Result<Self>` - The allocator, or a config error for an empty window
    pub fn new(start: u16, end: u32) -> Result<Self> {
        if u32::from(start) >= end || end > u32::from(u16::MAX) + 1 {
            return Err(Error::Config(format!(
                "port window [{}, {}) is empty or out of range",
                start, end
            )));
        }
        Ok(Self {
            next: AtomicU32::new(u32::from(start)),
            end,
        })
    }

    /// Creates the window owned by one parallel test node.
    ///
    /// Node `n` owns `[base + n * per_node, base + (n + 1) * per_node)`, so
    /// harness processes running side by side on one host never collide.
    pub fn for_node(base: u16, per_node: u16, node: u16) -> Result<Self> {
        let start = u32::from(base) + u32::from(node) * u32::from(per_node);
        let end = start + u32::from(per_node);
        let start = u16::try_from(start).map_err(|_| {
            Error::Config(format!("node {} port window starts beyond 65535", node))
        })?;
        Self::new(start, end)
    }

    /// Claims `n` consecutive, never-yet-claimed ports.
    ///
    /// # Returns
    /// * `Result<u16>` - The first port of the range
    pub fn claim_ports(&self, n: u16) -> Result<u16> {
        if n == 0 {
            return Err(Error::Config("cannot claim zero ports".to_string()));
        }
        let n32 = u32::from(n);
        let end = self.end;

        match self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                let claimed_end = next.checked_add(n32)?;
                (claimed_end <= end).then_some(claimed_end)
            }) {
            Ok(start) => {
                debug!("claimed ports {}..{}", start, start + n32);
                // start < end <= 65536 and the range fits, so start fits in u16
                Ok(start as u16)
            }
            Err(next) => Err(Error::PortExhaustion {
                requested: n,
                remaining: end.saturating_sub(next),
            }),
        }
    }

    /// Number of ports still available for claims.
    pub fn remaining(&self) -> u32 {
        self.end.saturating_sub(self.next.load(Ordering::Acquire))
    }
}
