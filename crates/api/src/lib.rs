//! HTTP surface of the email dispatch service.

pub mod routes;
pub mod state;
