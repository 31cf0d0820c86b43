pub mod result;
pub mod session;
pub mod user;
