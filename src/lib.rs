//! gaefile — an upload gateway that stores files under unguessable keys and
//! hands out short-lived signed download URLs.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
