pub mod bluetooth;
pub mod export;
pub mod logging;
