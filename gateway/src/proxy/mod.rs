pub mod auth;
pub mod context;
pub mod filter;
mod handler;

pub use context::BoxBody;
pub use handler::handle;
