//! Build-system gate.
//!
//! Image builds happen outside the core. The engine only needs one answer
//! from that system: is a build currently active for this service? The
//! external layer provides an implementation; the default reports none.

/// Answers whether a service has an active image build.
pub trait BuildGate: Send + Sync {
    fn has_active_build(&self, service_id: &str) -> bool;
}

/// Gate used when no build system is wired in.
pub struct NoBuilds;

impl BuildGate for NoBuilds {
    fn has_active_build(&self, _service_id: &str) -> bool {
        false
    }
}
