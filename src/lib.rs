//! Asynchronous chat relay: clients submit messages to an agent gateway and
//! poll a response store for the answers, matching each answer to the message
//! it belongs to.

pub mod agent;
pub mod client;
pub mod config;
pub mod errors;
pub mod models;
pub mod routes;
pub mod service;
pub mod store;
