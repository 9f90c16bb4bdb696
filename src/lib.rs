// src/lib.rs

pub mod broadcast;
pub mod config;
pub mod credentials;
pub mod error;
pub mod models;
pub mod rooms;
pub mod routes;
pub mod session;
pub mod state;
pub mod telemetry;
pub mod tokens;
pub mod websocket;
