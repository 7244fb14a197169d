pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod evaluation;
pub mod foundation;
pub mod market_data;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod predictor;
pub mod retry;
pub mod sequence_model;
pub mod status;
pub mod window;
