//! Agent - LLM-backed line item extraction
//!
//! The deterministic parser in `vocario-core` reads the usual ways artisans type their line
//! items. When it finds nothing, the conversation host asks this crate instead:
//! 1. **LLM client** (`llm`) - Anthropic, OpenAI or Ollama over HTTP behind `LlmClient`
//! 2. **Extraction** (`extraction`) - prompt, JSON answer parsing, mapping onto `LineItem`
//! 3. **Guardrails** (`guardrails`) - bounds on what the model may return
//!
//! # Safety Principle
//!
//! The LLM is strictly a transcriber. It NEVER sets a price the artisan did not write; totals,
//! VAT and deposits are computed by the core.

pub mod extraction;
pub mod guardrails;
pub mod llm;

pub use extraction::{DisabledExtractor, ExtractionError, LineItemExtraction, LlmLineItemExtractor};
pub use guardrails::{GuardrailDecision, GuardrailPolicy};
pub use llm::{HttpLlmClient, LlmClient};
