//! rabbitrun — consume a RabbitMQ queue with any executable.
//!
//! A long-running bridge between an AMQP 0-9-1 broker and an
//! operator-supplied executable: every message delivered on the configured
//! queue spawns one invocation of that executable, the message payload is
//! handed over as an encoded argument or via stdin, and the child's exit
//! code decides how the message is acknowledged.

pub mod acknowledger;
pub mod command;
pub mod config;
pub mod consumer;
pub mod delivery;
pub mod logging;
pub mod metrics;
pub mod processor;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::Config;
pub use consumer::Consumer;
