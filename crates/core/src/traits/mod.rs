pub mod definition_source;
pub mod executor;
pub mod message_queue;
pub mod store;
pub mod task_executor;

pub use definition_source::*;
pub use executor::*;
pub use message_queue::*;
pub use store::*;
pub use task_executor::*;
