pub mod channel;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod orchestrator;
pub mod paperflow_config;
pub mod stage;
pub mod stream;
pub mod ui;
pub mod worker;
