//! LLM enrichment processors.
//!
//! Each one is a no-op without a configured LLM service. Calls go through
//! the service gate; the first call that fails fails the whole step, which
//! the pipeline then rolls back unless the processor is strict.

mod equation;
mod figure;
mod table;

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tracing::debug;

pub use equation::LlmEquationProcessor;
pub use figure::LlmFigureProcessor;
pub use table::LlmTableProcessor;

use crate::{
    document::Document,
    entities::BlockID,
    error::StageError,
    pipeline::StageContext,
    service::{CallError, LlmRequest, LlmResponse},
};

/// One gated LLM call on behalf of `block`, recorded in its metadata.
///
/// An empty answer is retried like any transient failure. Tokens spent by
/// every attempt, empty or not, are added to the block's count.
pub(crate) async fn ask(
    doc: &mut Document,
    block: BlockID,
    request: LlmRequest,
    ctx: &StageContext,
) -> Result<Option<Value>, StageError> {
    let Some(llm) = &ctx.services.llm else {
        return Ok(None);
    };
    let spent = AtomicU64::new(0);
    let (spent_ref, request) = (&spent, &request);
    let answer = ctx
        .gate
        .call(llm.endpoint(), &ctx.cancel, || async move {
            let LlmResponse { value, tokens_used } = llm.complete(request).await?;
            spent_ref.fetch_add(tokens_used, Ordering::Relaxed);
            if is_empty_answer(&value) {
                return Err(CallError::Transient("empty structured answer".into()));
            }
            Ok(value)
        })
        .await;

    let tokens_used = spent.into_inner();
    let meta = &mut doc.block_mut(block)?.metadata;
    meta.llm_tokens_used += tokens_used;
    let value = answer?;
    meta.llm_request_count += 1;
    debug!(block, tokens_used, "llm answered");
    Ok(Some(value))
}

fn is_empty_answer(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// A required string field of a structured answer.
pub(crate) fn string_field(value: &Value, field: &str) -> Result<String, StageError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| StageError::msg(format!("answer has no '{field}'")))
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use async_trait::async_trait;
    use serde_json::Value;

    use crate::service::{CallError, LlmRequest, LlmResponse, LlmService};

    /// Answers every request with the same value, or rejects it.
    pub(crate) struct FakeLlm {
        pub answer: Result<Value, CallError>,
        pub calls: AtomicU32,
    }

    impl FakeLlm {
        pub(crate) fn answering(answer: Value) -> Arc<Self> {
            Arc::new(Self {
                answer: Ok(answer),
                calls: AtomicU32::new(0),
            })
        }

        pub(crate) fn rejecting() -> Arc<Self> {
            Arc::new(Self {
                answer: Err(CallError::Rejected("bad request".into())),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl LlmService for FakeLlm {
        fn endpoint(&self) -> &str {
            "fake-llm"
        }

        async fn complete(&self, _request: &LlmRequest) -> Result<LlmResponse, CallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.clone().map(|value| LlmResponse {
                value,
                tokens_used: 10,
            })
        }
    }
}
