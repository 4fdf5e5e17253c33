//! Core SchoolHub library (session manager, config, logging, in-memory backends).

pub mod config;
pub mod guard;
pub mod logging;
pub mod memory;
pub mod session;
