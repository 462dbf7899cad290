// Port allocation - hands out game ports that no other instance on this host uses

use std::collections::HashSet;
use std::net::UdpSocket;

/// Ports in use for one run, seeded with the ports of running instances
#[derive(Debug, Clone, Default)]
pub struct PortAllocator {
    range: Option<(u16, u16)>,
    used: HashSet<u16>,
}

impl PortAllocator {
    pub fn new(range: Option<(u16, u16)>) -> Self {
        Self {
            range,
            used: HashSet::new(),
        }
    }

    pub fn reserve(&mut self, port: u16) {
        self.used.insert(port);
    }

    pub fn is_free(&self, port: u16) -> bool {
        !self.used.contains(&port)
    }

    /// Lowest free port in the configured range, or an OS-assigned one without a range
    pub fn allocate(&mut self) -> Option<u16> {
        let port = match self.range {
            Some((low, high)) => (low..=high).find(|p| {
                let free = self.is_free(*p);
                if !free {
                    tracing::debug!("Port {} in use, trying {}", p, p.saturating_add(1));
                }
                free
            })?,
            None => os_assigned_port()?,
        };
        self.used.insert(port);
        Some(port)
    }

    /// Reuse `preferred` when it is still free and allowed, else allocate normally
    pub fn allocate_preferring(&mut self, preferred: Option<u16>) -> Option<u16> {
        if let Some(port) = preferred {
            let in_range = self
                .range
                .map(|(low, high)| (low..=high).contains(&port))
                .unwrap_or(true);
            if in_range && self.is_free(port) {
                self.used.insert(port);
                return Some(port);
            }
        }
        self.allocate()
    }
}

// Game traffic is UDP, so ask the OS for a free UDP port
fn os_assigned_port() -> Option<u16> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.local_addr().ok().map(|addr| addr.port())
}
