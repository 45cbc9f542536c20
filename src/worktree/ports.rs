use sha2::{Digest, Sha256};

use crate::config::WorktreeConfig;
use crate::error::{AppError, Result};

/// Deterministic backend/frontend port-pair allocation.
///
/// The workflow id hashes to an offset into two disjoint reserved ranges;
/// a bind collision linear-probes both ports together to the next free
/// pair, so concurrent workflows up to the range size never share a port.
pub struct PortAllocator {
    backend_base: u16,
    frontend_base: u16,
    range: u16,
}

impl PortAllocator {
    pub fn new(config: &WorktreeConfig) -> Self {
        Self {
            backend_base: config.backend_port_base,
            frontend_base: config.frontend_port_base,
            range: config.port_range.max(1),
        }
    }

    fn initial_offset(&self, workflow_id: &str) -> u16 {
        let digest = Sha256::digest(workflow_id.as_bytes());
        let word = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        (word % u32::from(self.range)) as u16
    }

    fn pair_at(&self, offset: u16) -> (u16, u16) {
        (self.backend_base + offset, self.frontend_base + offset)
    }

    /// The pair a workflow id hashes to, before probing.
    pub fn pair_for(&self, workflow_id: &str) -> (u16, u16) {
        self.pair_at(self.initial_offset(workflow_id))
    }

    /// Allocate a free pair, probing from the deterministic starting point.
    pub fn allocate(&self, workflow_id: &str) -> Result<(u16, u16)> {
        self.allocate_with(workflow_id, port_is_free)
    }

    /// Probing with an injectable availability check, for tests.
    pub fn allocate_with(
        &self,
        workflow_id: &str,
        available: impl Fn(u16) -> bool,
    ) -> Result<(u16, u16)> {
        let start = self.initial_offset(workflow_id);
        for probe in 0..self.range {
            let offset = (start + probe) % self.range;
            let (backend, frontend) = self.pair_at(offset);
            if available(backend) && available(frontend) {
                return Ok((backend, frontend));
            }
        }
        Err(AppError::Worktree(format!(
            "No free port pair in ranges {}..{} / {}..{}",
            self.backend_base,
            self.backend_base + self.range,
            self.frontend_base,
            self.frontend_base + self.range,
        )))
    }
}

fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> PortAllocator {
        PortAllocator {
            backend_base: 9100,
            frontend_base: 9200,
            range: 15,
        }
    }

    #[test]
    fn test_pair_is_deterministic() {
        let ports = allocator();
        let first = ports.pair_for("abc12345");
        let second = ports.pair_for("abc12345");
        assert_eq!(first, second);
    }

    #[test]
    fn test_pair_within_ranges_and_aligned() {
        let ports = allocator();
        for id in ["abc12345", "deadbeef", "00000001", "ffffffff"] {
            let (backend, frontend) = ports.pair_for(id);
            assert!((9100..9115).contains(&backend));
            assert!((9200..9215).contains(&frontend));
            // Both ports share one offset so a single probe moves the pair.
            assert_eq!(frontend - backend, 100);
        }
    }

    #[test]
    fn test_collision_probes_to_disjoint_pair() {
        let ports = allocator();
        let (taken_backend, _) = ports.pair_for("abc12345");

        // The colliding workflow must land on a different pair.
        let (backend, frontend) =
            ports.allocate_with("abc12345", |p| p != taken_backend).unwrap();
        assert_ne!(backend, taken_backend);
        assert_eq!(frontend - backend, 100);
    }

    #[test]
    fn test_exhausted_range_errors() {
        let ports = allocator();
        let err = ports.allocate_with("abc12345", |_| false).unwrap_err();
        assert!(matches!(err, AppError::Worktree(_)));
    }

    #[test]
    fn test_allocate_against_real_sockets() {
        let ports = allocator();
        let (backend, frontend) = ports.allocate("abc12345").unwrap();
        // The returned pair must actually be bindable.
        let _b = std::net::TcpListener::bind(("127.0.0.1", backend)).unwrap();
        let _f = std::net::TcpListener::bind(("127.0.0.1", frontend)).unwrap();
    }
}
