//! Core services: key generation, deadline-bounded copying, the object
//! store, URL signing, and the gateway that wires them per request.

pub mod deadline_copy;
pub mod gateway;
pub mod key_generator;
pub mod signing;
pub mod storage_service;
