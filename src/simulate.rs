//! Simulated phase capabilities for `taskforge run`.
//!
//! Each phase sleeps for a short random latency and answers with a canned
//! result. Verification reports a fixed confidence score; `flaky` makes the
//! first N calls of every phase run fail transiently so retry behaviour is
//! visible.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use taskforge_core::error::Result;
use taskforge_core::traits::PhaseCapability;
use taskforge_core::types::{Phase, PhaseInput, PhaseOutput};
use taskforge_scheduler::PhaseCapabilities;

pub struct SimulatedCapability {
    phase: Phase,
    dependency: String,
    score: f64,
    flaky: u32,
    /// Failed calls so far, per task id still inside its flaky window.
    calls: Mutex<HashMap<String, u32>>,
}

impl SimulatedCapability {
    pub fn new(phase: Phase, score: f64, flaky: u32) -> Self {
        Self {
            phase,
            dependency: format!("{}-service", phase.to_string().to_lowercase()),
            score,
            flaky,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// 1-based call number within the current run. The entry is dropped once
    /// the run gets past its flaky calls.
    fn next_call(&self, task_id: &str) -> u32 {
        if self.flaky == 0 {
            return 1;
        }
        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        let n = calls.get(task_id).copied().unwrap_or(0) + 1;
        if n > self.flaky {
            calls.remove(task_id);
        } else {
            calls.insert(task_id.to_string(), n);
        }
        n
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl PhaseCapability for SimulatedCapability {
    fn name(&self) -> &str {
        match self.phase {
            Phase::Discovery => "simulated-discovery",
            Phase::Planning => "simulated-planning",
            Phase::Execution => "simulated-execution",
            Phase::Verification => "simulated-verification",
        }
    }

    fn dependency(&self) -> &str {
        &self.dependency
    }

    async fn invoke(&self, input: &PhaseInput) -> Result<PhaseOutput> {
        let latency = Duration::from_millis(rand::thread_rng().gen_range(10..60));
        tokio::time::sleep(latency).await;

        let call = self.next_call(&input.task_id);
        if call <= self.flaky {
            return Ok(PhaseOutput::transient(format!(
                "{} unavailable (simulated, call {})",
                self.dependency, call
            )));
        }

        let result = serde_json::json!({
            "phase": self.phase,
            "iteration": input.iteration,
            "latency_ms": latency.as_millis() as u64,
        });
        let output = PhaseOutput::success(result);
        Ok(match self.phase {
            Phase::Verification if self.score < 100.0 => output
                .with_confidence(self.score)
                .with_gaps([format!("coverage below {:.0}", self.score)]),
            Phase::Verification => output.with_confidence(self.score),
            _ => output,
        })
    }
}

/// One simulated capability per phase.
pub fn capabilities(score: f64, flaky: u32) -> PhaseCapabilities {
    PhaseCapabilities {
        discovery: Arc::new(SimulatedCapability::new(Phase::Discovery, score, flaky)),
        planning: Arc::new(SimulatedCapability::new(Phase::Planning, score, flaky)),
        execution: Arc::new(SimulatedCapability::new(Phase::Execution, score, flaky)),
        verification: Arc::new(SimulatedCapability::new(Phase::Verification, score, flaky)),
    }
}
