pub mod assets;
pub mod config;
pub mod models;
pub mod orchestration;
pub mod persistence;
pub mod probe;
pub mod sqlite;
pub mod vision;
