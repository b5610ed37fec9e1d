//! Scan lifecycle coordination
//!
//! Submits images to a shared record store for asynchronous multi-analyzer
//! processing (text extraction, classification, face detection) and keeps a
//! local view of each scan in sync as partial results arrive.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
