pub mod jwt;
pub mod middleware;

pub use middleware::{authenticate, Identity, JwtSecret};
