pub mod hub;
pub mod listeners;
pub mod types;

pub use hub::EventHub;
pub use listeners::{Listeners, Retention, Subscription};
pub use types::ErrorNotice;
