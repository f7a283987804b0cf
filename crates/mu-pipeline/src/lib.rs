//! The command pipeline: authenticated envelopes in, journaled lifecycle
//! transitions and outbox presentations out. Everything that mutates durable
//! state funnels through one serialized lane.

pub mod cli;
pub mod handlers;
pub mod identity_handlers;
pub mod pipeline;
pub mod result;

pub use cli::{
    CliBridgeHandler, CliInvocation, CliInvocationPlan, CliOutcomeKind, MuCliRunner,
    SubprocessCliRunner,
};
pub use handlers::{CommandHandler, HandlerOutcome, HandlerRegistry, ReplayMutationEvent};
pub use pipeline::CommandPipeline;
pub use result::{PipelineCounters, PipelineResult};
