pub mod coordinator;
pub mod first_load;
pub mod tick_guard;

pub use coordinator::{CoordinatorHandle, StreamEvent, StreamingCoordinator};
