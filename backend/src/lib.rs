pub mod inference;
pub mod routes;
pub mod session;
