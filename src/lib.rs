pub mod config;
pub mod drone;
pub mod flight;
pub mod sensor_logger;
pub mod sensors;
pub mod session;
pub mod storage;
pub mod transfer;
pub mod util;
