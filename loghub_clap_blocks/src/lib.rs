//! Building blocks for the command line and environment configuration of a log store
//! consumer.

pub mod consumer;
pub mod logging;
