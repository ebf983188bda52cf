pub mod config;
pub mod error;
pub mod genie;
pub mod instrument;
pub mod jsonl_reader;
pub mod notes;
pub mod osc_sender;
pub mod pipeline;
pub mod session_log;
pub mod simulator;
pub mod types;
pub mod weights;
pub mod worker;
