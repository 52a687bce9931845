//! The NUMA oracle.
//!
//! A conservative topology estimate plus a core → thread registry. The task
//! stealer consults this to sweep victims in locality order; everything else
//! treats it as opaque.
//!
//! Detection deliberately errs toward a single domain: a wrong multi-domain
//! guess costs more than a missed one, so machines only get split into
//! estimated domains once the core count is large.

use core::sync::atomic::{AtomicPtr, Ordering};
use std::sync::OnceLock;

use tracing::debug;

use crate::team::Thread;

// -----------------------------------------------------------------------------
// Topology

pub struct Topology {
    core_to_domain: Vec<usize>,
    domain_cores: Vec<Vec<usize>>,
}

impl Topology {
    fn detect() -> Topology {
        let num_cores = crate::team::hardware_concurrency();

        // Single domain unless the machine is large; then estimate one domain
        // per 16 cores, capped, with cores assigned round-robin.
        let domains = if num_cores > 32 {
            (num_cores / 16).clamp(1, 4)
        } else {
            1
        };

        let mut core_to_domain = Vec::with_capacity(num_cores);
        let mut domain_cores = vec![Vec::new(); domains];
        for core in 0..num_cores {
            let domain = core % domains;
            core_to_domain.push(domain);
            domain_cores[domain].push(core);
        }

        debug!(num_cores, domains, "numa topology estimated");
        Topology {
            core_to_domain,
            domain_cores,
        }
    }

    pub fn num_cores(&self) -> usize {
        self.core_to_domain.len()
    }

    pub fn num_domains(&self) -> usize {
        self.domain_cores.len()
    }

    pub fn domain_of_core(&self, core: usize) -> Option<usize> {
        self.core_to_domain.get(core).copied()
    }

    pub fn cores_in_domain(&self, domain: usize) -> &[usize] {
        &self.domain_cores[domain]
    }
}

static TOPOLOGY: OnceLock<Topology> = OnceLock::new();

pub fn topology() -> &'static Topology {
    TOPOLOGY.get_or_init(Topology::detect)
}

/// Forces detection; called once during runtime initialization so the first
/// parallel region doesn't pay for it.
pub fn initialize() {
    let _ = topology();
}

// -----------------------------------------------------------------------------
// Thread registry

static CORE_THREADS: OnceLock<Vec<AtomicPtr<Thread>>> = OnceLock::new();

fn registry() -> &'static [AtomicPtr<Thread>] {
    CORE_THREADS.get_or_init(|| {
        (0..topology().num_cores())
            .map(|_| AtomicPtr::new(core::ptr::null_mut()))
            .collect()
    })
}

/// Records which thread runs on a logical CPU. Called once per worker during
/// team construction, after pinning.
pub fn register_thread(thread: &'static Thread, core: usize) {
    let slots = registry();
    if let Some(slot) = slots.get(core) {
        slot.store(thread as *const Thread as *mut Thread, Ordering::Release);
    }
}

/// The thread currently registered on a logical CPU, if any.
pub fn thread_for_core(core: usize) -> Option<&'static Thread> {
    let slot = registry().get(core)?;
    let ptr = slot.load(Ordering::Acquire);
    // Threads live for the whole process once registered.
    unsafe { ptr.as_ref() }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_core_has_a_domain() {
        let topo = topology();
        assert!(topo.num_domains() >= 1);
        for core in 0..topo.num_cores() {
            let domain = topo.domain_of_core(core).unwrap();
            assert!(domain < topo.num_domains());
            assert!(topo.cores_in_domain(domain).contains(&core));
        }
    }

    #[test]
    fn domain_core_lists_partition_the_cores() {
        let topo = topology();
        let total: usize = (0..topo.num_domains())
            .map(|d| topo.cores_in_domain(d).len())
            .sum();
        assert_eq!(total, topo.num_cores());
    }

    #[test]
    fn unregistered_core_has_no_thread() {
        assert!(thread_for_core(usize::MAX).is_none());
    }
}
