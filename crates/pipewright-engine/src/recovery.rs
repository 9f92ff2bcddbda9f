use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use pipewright_core::config::EngineConfig;
use pipewright_core::error::{PipewrightError, Result};
use pipewright_core::graph::Node;
use pipewright_core::types::{cache_key, Recovery};

use crate::context::ExecutionContext;

const RETRYABLE_MARKERS: &[&str] = &[
    "network",
    "fetch",
    "connection",
    "timeout",
    "timed out",
    "429",
    "rate limit",
];

/// Whether a failure looks transient enough to retry.
///
/// Only the underlying message is inspected, never the node type a variant
/// carries. Config, input and graph errors are never retried.
pub fn is_retryable(error: &PipewrightError) -> bool {
    let message = match error {
        PipewrightError::NodeTimedOut { .. } => return true,
        PipewrightError::Execution { message, .. } => message.clone(),
        PipewrightError::Http(message) | PipewrightError::TextGeneration(message) => {
            message.clone()
        }
        PipewrightError::Io(e) => e.to_string(),
        PipewrightError::InvalidConfig { .. }
        | PipewrightError::InvalidInput { .. }
        | PipewrightError::PipelineNotFound(_)
        | PipewrightError::Validation(_)
        | PipewrightError::CircularDependency { .. }
        | PipewrightError::UnknownExecutorType(_)
        | PipewrightError::MissingUpstreamOutput(_)
        | PipewrightError::Config(_)
        | PipewrightError::ConfigNotFound(_)
        | PipewrightError::Store(_)
        | PipewrightError::Json(_) => return false,
    };
    let message = message.to_lowercase();
    RETRYABLE_MARKERS.iter().any(|m| message.contains(m))
}

/// Ordered fallbacks for a failing node: retry, cached output, skip.
#[derive(Debug, Clone)]
pub struct RecoveryChain {
    default_max_retries: u32,
    base_delay: Duration,
}

impl RecoveryChain {
    pub fn new(default_max_retries: u32, base_delay: Duration) -> Self {
        Self {
            default_max_retries,
            base_delay,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.default_max_retries,
            Duration::from_millis(config.retry_base_delay_ms),
        )
    }

    /// Delay before retry `k` (1-based): `base * 2^(k-1)`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Try to recover from `error`. The first strategy that yields a value wins.
    ///
    /// `invoke` re-runs the executor with the original input and timeout.
    /// Every outcome is logged on `ctx`. When nothing applies, the node is
    /// tagged `pipeline_stopped` and the original error is returned.
    pub async fn recover<F, Fut>(
        &self,
        node: &Node,
        error: PipewrightError,
        ctx: &mut ExecutionContext,
        mut invoke: F,
    ) -> Result<(Value, Recovery)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let max_retries = node
            .config
            .max_retries()
            .unwrap_or(self.default_max_retries);

        if max_retries > 0 && is_retryable(&error) {
            for retry in 1..=max_retries {
                let delay = self.backoff(retry);
                info!(
                    node_id = %node.id,
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying node"
                );
                tokio::time::sleep(delay).await;

                match invoke().await {
                    Ok(value) => {
                        let recovery = Recovery::RetrySuccess { attempt: retry + 1 };
                        ctx.add_error(&node.id, &error, &recovery);
                        return Ok((value, recovery));
                    }
                    Err(e) => {
                        warn!(node_id = %node.id, retry, error = %e, "Retry failed");
                    }
                }
            }
        }

        if node.config.use_cached_on_error() {
            if let Some(cached) = ctx.get_storage(&cache_key(&node.id)) {
                let recovery = Recovery::UsedCachedData;
                ctx.add_error(&node.id, &error, &recovery);
                ctx.add_warning(&node.id, format!("Using cached data after error: {}", error));
                return Ok((cached, recovery));
            }
        }

        if node.config.skip_on_error() {
            let recovery = Recovery::Skipped;
            ctx.add_error(&node.id, &error, &recovery);
            ctx.add_warning(&node.id, format!("Node skipped after error: {}", error));
            return Ok((Value::Null, recovery));
        }

        ctx.add_error(&node.id, &error, &Recovery::PipelineStopped);
        Err(error)
    }
}

impl Default for RecoveryChain {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}
