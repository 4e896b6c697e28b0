//! Deterministic phase capability doubles for tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use taskforge_core::error::{Result, TaskForgeError};
use taskforge_core::traits::PhaseCapability;
use taskforge_core::types::{PhaseInput, PhaseOutput};

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum Step {
    Output(PhaseOutput),
    /// An error outside the collaborator taxonomy.
    Unexpected(String),
    /// `Err(Cancelled)` raised by the capability itself.
    Cancelled,
    Panic(String),
}

/// Replays `script` in order, then repeats `fallback` forever.
pub struct ScriptedCapability {
    name: String,
    dependency: String,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    delay: Option<Duration>,
    calls: AtomicU32,
    inputs: Mutex<Vec<PhaseInput>>,
}

impl ScriptedCapability {
    /// Succeeds every time with `{"by": name}`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            dependency: format!("{name}-dep"),
            script: Mutex::new(VecDeque::new()),
            fallback: Step::Output(PhaseOutput::success(serde_json::json!({ "by": name }))),
            delay: None,
            calls: AtomicU32::new(0),
            inputs: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, step: Step) -> Self {
        self.script.lock().unwrap().push_back(step);
        self
    }

    pub fn then_transient(self, times: usize) -> Self {
        (0..times).fold(self, |cap, i| {
            cap.then(Step::Output(PhaseOutput::transient(format!("transient #{}", i + 1))))
        })
    }

    pub fn otherwise(mut self, step: Step) -> Self {
        self.fallback = step;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<PhaseInput> {
        self.inputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl PhaseCapability for ScriptedCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependency(&self) -> &str {
        &self.dependency
    }

    async fn invoke(&self, input: &PhaseInput) -> Result<PhaseOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().unwrap().push(input.clone());
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match step {
            Step::Output(output) => Ok(output),
            Step::Unexpected(msg) => Err(TaskForgeError::Config(msg)),
            Step::Cancelled => Err(TaskForgeError::Cancelled),
            Step::Panic(msg) => panic!("{msg}"),
        }
    }
}
