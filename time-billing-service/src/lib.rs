//! Time-entry billing and annual hour allowance accounting.

pub mod config;
pub mod models;
pub mod services;
pub mod startup;
