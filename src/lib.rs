//! Object Detection Worker
//!
//! This library provides the core of the detect-worker system, which consumes
//! detection requests from a Redis-backed queue, runs a YOLO model over images
//! held in S3-compatible storage, and persists the labelled results to
//! PostgreSQL before acknowledging the request.

pub mod app_state;
pub mod config;
pub mod consumer;
pub mod db;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod services;
