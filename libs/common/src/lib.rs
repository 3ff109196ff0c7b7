pub mod id;
pub mod time;

pub use time::epoch_ms;
