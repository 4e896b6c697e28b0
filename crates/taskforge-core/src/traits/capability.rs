//! Phase capability trait: the opaque unit of work behind each workflow phase.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{PhaseInput, PhaseOutput};

/// One capability per phase (discovery, planning, execution, verification).
///
/// Implementations report transient or permanent failures either through
/// [`PhaseOutput::status`] or by returning the matching [`TaskForgeError`]
/// variant. Any other error is treated as permanent.
///
/// [`TaskForgeError`]: crate::error::TaskForgeError
#[async_trait]
pub trait PhaseCapability: Send + Sync {
    /// Capability name, used in logs.
    fn name(&self) -> &str;

    /// External dependency this capability talks to (e.g. "code-host").
    /// Calls are gated by the circuit breaker registered under this name.
    fn dependency(&self) -> &str;

    /// Run the phase.
    async fn invoke(&self, input: &PhaseInput) -> Result<PhaseOutput>;
}
