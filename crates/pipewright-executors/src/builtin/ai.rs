use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use pipewright_core::error::{PipewrightError, Result};
use pipewright_core::graph::NodeConfig;
use pipewright_core::traits::{Executor, TextGenerator};
use pipewright_core::types::StepContext;

use super::util::{render_template, set_path};

pub struct AiTransformExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AiTransformSettings {
    prompt: String,
    #[serde(default)]
    output_field: Option<String>,
    /// Send one prompt per array element instead of one for the whole input.
    #[serde(default)]
    per_item: bool,
}

impl AiTransformSettings {
    fn build_prompt(&self, input: &Value, ctx: &StepContext) -> String {
        let serialized = serde_json::to_string_pretty(input).unwrap_or_default();
        let prompt = self.prompt.replace("{{input}}", &serialized);
        render_template(&prompt, input, Some(ctx))
    }

    async fn transform(
        &self,
        generator: &Arc<dyn TextGenerator>,
        input: Value,
        ctx: &StepContext,
    ) -> Result<Value> {
        let prompt = self.build_prompt(&input, ctx);
        debug!(node_id = %ctx.node_id, prompt_len = prompt.len(), "Generating text");
        let text = generator.generate(prompt).await?;
        // Structured replies are kept structured.
        let reply = serde_json::from_str::<Value>(text.trim()).unwrap_or(Value::String(text));

        match &self.output_field {
            Some(field) if input.is_object() => {
                let mut row = input;
                set_path(&mut row, field, reply);
                Ok(row)
            }
            _ => Ok(reply),
        }
    }
}

impl Executor for AiTransformExecutor {
    fn description(&self) -> &str {
        "Send the input through a text generator using a prompt template."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: AiTransformSettings = config.parse("ai_transform")?;
            let generator = ctx.text_generator.clone().ok_or_else(|| {
                PipewrightError::TextGeneration("no text generator configured".to_string())
            })?;

            match input {
                Value::Array(items) if settings.per_item => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(settings.transform(&generator, item, &ctx).await?);
                    }
                    Ok(Value::Array(out))
                }
                other => settings.transform(&generator, other, &ctx).await,
            }
        })
    }

    fn validate(&self, config: &NodeConfig) -> Vec<String> {
        match config.get("prompt").and_then(Value::as_str) {
            Some(p) if !p.trim().is_empty() => vec![],
            _ => vec!["prompt is required".to_string()],
        }
    }
}
