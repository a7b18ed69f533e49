pub mod history;
pub mod logging;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod status;
