pub mod debugger;
pub mod event_pool;
pub mod host_debuggers;
pub mod inferior;
pub mod registers;
pub mod sections;
