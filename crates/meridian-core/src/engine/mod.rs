//! Engine dispatcher (C6): the component that turns ready task nodes into
//! executor calls, bridging [`crate::dependency`], [`crate::context`], and
//! [`crate::executor`] against a concrete store.

mod dispatcher;

pub use dispatcher::{EngineConfig, EngineDispatcher, EngineError, EngineStatus};
