use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::Value;

use pipewright_core::error::{PipewrightError, Result};
use pipewright_core::graph::NodeConfig;
use pipewright_core::traits::{Executor, NotificationSink, TextGenerator};
use pipewright_core::types::StepContext;

// ── Executors ───────────────────────────────────────────────────

/// Returns its input unchanged.
pub struct EchoExecutor;

impl Executor for EchoExecutor {
    fn description(&self) -> &str {
        "echo"
    }

    fn execute(
        &self,
        input: Value,
        _config: NodeConfig,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move { Ok(input) })
    }
}

type StepFn = dyn Fn(Value, &NodeConfig, &StepContext) -> Result<Value> + Send + Sync;

/// Executor backed by a synchronous closure.
pub struct FnExecutor {
    f: Arc<StepFn>,
}

impl FnExecutor {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Value, &NodeConfig, &StepContext) -> Result<Value> + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }
}

impl Executor for FnExecutor {
    fn description(&self) -> &str {
        "closure"
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        let f = self.f.clone();
        Box::pin(async move { f(input, &config, &ctx) })
    }
}

/// Fails `failures` times with `message`, then echoes its input.
pub struct FlakyExecutor {
    failures: u32,
    message: String,
    calls: Arc<AtomicU32>,
}

impl FlakyExecutor {
    pub fn new(failures: u32, message: impl Into<String>) -> Self {
        Self {
            failures,
            message: message.into(),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Shared call counter, readable after the executor moves into a registry.
    pub fn counter(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

impl Executor for FlakyExecutor {
    fn description(&self) -> &str {
        "flaky"
    }

    fn execute(
        &self,
        input: Value,
        _config: NodeConfig,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(PipewrightError::execution("flaky", self.message.clone()));
            }
            Ok(input)
        })
    }
}

/// Always fails with `message`.
pub struct FailingExecutor {
    message: String,
}

impl FailingExecutor {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Executor for FailingExecutor {
    fn description(&self) -> &str {
        "failing"
    }

    fn execute(
        &self,
        _input: Value,
        _config: NodeConfig,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move { Err(PipewrightError::execution("failing", self.message.clone())) })
    }
}

/// Never completes.
pub struct HangingExecutor;

impl Executor for HangingExecutor {
    fn description(&self) -> &str {
        "hanging"
    }

    fn execute(
        &self,
        _input: Value,
        _config: NodeConfig,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(futures::future::pending())
    }
}

// ── Collaborators ───────────────────────────────────────────────

/// Notification sink that keeps every `(title, message)` pair.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl NotificationSink for RecordingNotifier {
    fn notify(&self, title: &str, message: &str) -> BoxFuture<'_, Result<()>> {
        let entry = (title.to_string(), message.to_string());
        Box::pin(async move {
            if let Ok(mut sent) = self.sent.lock() {
                sent.push(entry);
            }
            Ok(())
        })
    }
}

/// Notification sink whose delivery always fails.
pub struct BrokenNotifier;

impl NotificationSink for BrokenNotifier {
    fn notify(&self, _title: &str, _message: &str) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Err(PipewrightError::Io(std::io::Error::other("sink offline"))) })
    }
}

/// Text generator returning a fixed reply and recording prompts.
pub struct StaticTextGenerator {
    reply: String,
    prompts: Mutex<Vec<String>>,
}

impl StaticTextGenerator {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl TextGenerator for StaticTextGenerator {
    fn generate(&self, prompt: String) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            if let Ok(mut prompts) = self.prompts.lock() {
                prompts.push(prompt);
            }
            Ok(self.reply.clone())
        })
    }
}
