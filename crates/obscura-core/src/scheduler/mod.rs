//! Frame scheduling: the pipeline context and the default dispatcher.

mod context;
mod dispatcher;

pub use context::{ContextState, PipelineContext};
pub use dispatcher::FanInDispatcher;
