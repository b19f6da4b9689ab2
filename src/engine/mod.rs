// Reverie Engine — pipeline modules
// Leaves-first composition: byte streams in, card + lorebook artifacts out.
// Everything below `generation/` is a pure transform over I/O; the
// generation engine owns all LLM effects, concurrency, and durable state.

pub mod budget;
pub mod cache;
pub mod dataset;
pub mod formats;
pub mod fsio;
pub mod generation;
pub mod llm;
pub mod opener;
pub mod prompts;
pub mod sampler;
pub mod stream;
