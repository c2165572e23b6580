//! Connection admission
//!
//! Two gates sit in front of every session: a global concurrency cap
//! (bounded semaphore, non-blocking acquire; the accept loop never queues)
//! and a per-source-address cap tracked in a counter map. Both release
//! through the [`AdmissionPermit`] handle when the session ends, so a
//! panicking session still gives its slots back.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::warn;

pub struct AdmissionControl {
    global: Arc<Semaphore>,
    per_ip: Arc<Mutex<HashMap<IpAddr, usize>>>,
    max_per_ip: usize,
}

/// Why a connection was refused.
#[derive(Debug, PartialEq, Eq)]
pub enum AdmissionRefusal {
    ServerFull,
    TooManyFromAddress,
}

/// Held for the lifetime of an admitted session; releases both the global
/// slot and the per-IP count on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    _global: OwnedSemaphorePermit,
    ip: IpAddr,
    per_ip: Arc<Mutex<HashMap<IpAddr, usize>>>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let mut map = self.per_ip.lock().expect("per-ip admission map poisoned");
        if let Some(count) = map.get_mut(&self.ip) {
            *count -= 1;
            if *count == 0 {
                map.remove(&self.ip);
            }
        }
    }
}

impl AdmissionControl {
    pub fn new(max_connections: usize, max_per_ip: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(max_connections)),
            per_ip: Arc::new(Mutex::new(HashMap::new())),
            max_per_ip,
        }
    }

    /// Try to admit a connection from `ip`. Never blocks.
    pub fn try_admit(&self, ip: IpAddr) -> Result<AdmissionPermit, AdmissionRefusal> {
        let global = match self.global.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                warn!("Global connection limit reached, refusing {}", ip);
                return Err(AdmissionRefusal::ServerFull);
            }
            Err(TryAcquireError::Closed) => return Err(AdmissionRefusal::ServerFull),
        };

        {
            let mut map = self.per_ip.lock().expect("per-ip admission map poisoned");
            let count = map.entry(ip).or_insert(0);
            if *count >= self.max_per_ip {
                warn!("Per-IP connection limit reached for {}", ip);
                return Err(AdmissionRefusal::TooManyFromAddress);
            }
            *count += 1;
        }

        Ok(AdmissionPermit {
            _global: global,
            ip,
            per_ip: self.per_ip.clone(),
        })
    }

    /// Current open-session count for an address.
    pub fn connections_from(&self, ip: IpAddr) -> usize {
        self.per_ip
            .lock()
            .expect("per-ip admission map poisoned")
            .get(&ip)
            .copied()
            .unwrap_or(0)
    }

    pub fn available_slots(&self) -> usize {
        self.global.available_permits()
    }
}
