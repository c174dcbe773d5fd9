//! Lifecycle event fanout.
//!
//! One broadcast bus carries every lifecycle event the core emits; the
//! chat surface subscribes to render approval prompts and progress, and a
//! bounded history ring retains recent events for inspection.
//!
//! 1. **Types** (`types.rs`): the tagged event enum and its stable
//!    `event_type()` strings.
//! 2. **Bus** (`bus.rs`): Tokio broadcast pub/sub plus the history ring.

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventHistory, SharedEventBus};
pub use types::SupervisionEvent;
