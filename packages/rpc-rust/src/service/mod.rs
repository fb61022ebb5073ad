//! Operation dispatch framework.
//!
//! 1. **Registry** (`registry`): operation tag -> handler
//! 2. **Routing** (`router`): looks the tag up, answers unknown tags
//! 3. **Middleware** (`middleware`): Tower layers (load shedding, timeout, metrics)
//! 4. **Dispatch** (`dispatcher`): runs the pipeline and publishes the reply
//! 5. **Built-ins** (`domain`): handlers every server carries
//! 6. **Background workers** (`worker`): periodic tasks

pub mod dispatcher;
pub mod domain;
pub mod middleware;
pub mod operation;
pub mod registry;
pub mod router;
pub mod worker;

pub use dispatcher::Dispatcher;
pub use operation::{OperationError, OperationRequest};
pub use registry::{HandlerRegistry, OperationHandler};
pub use router::OperationRouter;
pub use worker::{BackgroundRunnable, BackgroundWorker};
