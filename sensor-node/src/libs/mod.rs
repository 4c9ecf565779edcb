pub mod config;
pub mod sensor_task;
