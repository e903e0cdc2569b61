//! CLI command implementations.

mod append;
mod connect;
mod start;
mod validate;

pub use append::run_append;
pub use connect::run_connect;
pub use start::run_start;
pub use validate::run_validate;
