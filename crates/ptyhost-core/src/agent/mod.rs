//! Agent implementations that are not tied to a platform.

pub mod mock;

pub use mock::{MockAgent, MockController};
pub use ptyhost_common::traits::{
    AgentEndpoints, AgentInbound, AgentOutbound, AgentSignal, PtyAgent,
};
