pub mod config;
pub mod events;

pub use config::Config;
pub use events::{EventDispatcher, EventSinks, SinkEvent};
