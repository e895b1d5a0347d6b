use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::ops::Range;
use std::sync::{Arc, Mutex};

use rand::{thread_rng, Rng};

use crate::error::{Error, Result};

const MIN_PORT: u16 = 32768;
const MAX_PORT: u16 = 61000;
const PORT_RANGE: Range<u16> = MIN_PORT..MAX_PORT;

/// How many random candidates are probed per requested port before giving up.
const ATTEMPTS_PER_PORT: usize = 64;

/// Hands out free local TCP ports.
///
/// Clones share the set of ports currently handed out, so controllers that are given
/// the same pool never receive overlapping ports. Ports are not reserved at the OS
/// level: another process can still grab one between allocation and use.
#[derive(Clone, Debug, Default)]
pub struct PortPool {
    /// Ports in use
    taken: Arc<Mutex<HashSet<u16>>>,
}

impl PortPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `count` distinct ports that are currently bindable on the loopback interface.
    pub fn allocate(&self, count: usize) -> Result<Vec<u16>> {
        let mut taken = self.taken.lock().map_err(|_| Error::PortAllocation {
            requested: count,
            reason: "port pool lock poisoned".into(),
        })?;

        // Probe listeners stay open until the whole batch is found, so the OS cannot
        // hand the same port back twice within one call.
        let mut probes = Vec::with_capacity(count);
        let mut ports = Vec::with_capacity(count);
        let mut rng = thread_rng();

        for _ in 0..count.saturating_mul(ATTEMPTS_PER_PORT) {
            if ports.len() == count {
                break;
            }
            let candidate = rng.gen_range(PORT_RANGE);
            if taken.contains(&candidate) || ports.contains(&candidate) {
                continue;
            }
            match TcpListener::bind((Ipv4Addr::LOCALHOST, candidate)) {
                Ok(listener) => {
                    probes.push(listener);
                    ports.push(candidate);
                }
                Err(e) => trace!("Port {} is not bindable: {}", candidate, e),
            }
        }

        if ports.len() < count {
            return Err(Error::PortAllocation {
                requested: count,
                reason: format!(
                    "only found {} bindable port(s) in {}..{}",
                    ports.len(),
                    MIN_PORT,
                    MAX_PORT
                ),
            });
        }

        taken.extend(ports.iter().copied());
        drop(probes);
        debug!("Allocated ports {:?}", ports);
        Ok(ports)
    }

    /// Returns ports to the pool.
    pub fn release(&self, ports: &[u16]) {
        match self.taken.lock() {
            Ok(mut taken) => ports.iter().for_each(|p| {
                taken.remove(p);
            }),
            Err(_) => warn!("Port pool lock poisoned; ports {:?} not released", ports),
        }
    }

    pub fn is_in_use(&self, port: u16) -> bool {
        self.taken
            .lock()
            .map(|taken| taken.contains(&port))
            .unwrap_or(false)
    }
}
