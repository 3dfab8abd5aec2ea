pub mod cache;
pub mod candles;
pub mod fetch;
pub mod key;
pub mod mutations;
pub mod orchestrator;
pub mod pipeline;
pub mod remote;
pub mod schedule;
pub mod selection;
