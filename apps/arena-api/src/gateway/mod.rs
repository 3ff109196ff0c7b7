pub mod buffer;
pub mod dispatcher;
pub mod events;
pub mod fanout;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod session;
