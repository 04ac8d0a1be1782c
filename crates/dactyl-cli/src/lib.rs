//! Dactyl CLI library

pub mod commands;
