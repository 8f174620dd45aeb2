//! weightvault fetches model weight files, verifies them, and keeps exactly
//! one copy of each in a canonical storage tree that every consumer tool
//! reaches through symlinks.

pub mod api;
pub mod catalog;
pub mod config;
pub mod download;
pub mod progress;
pub mod service;
pub mod storage;
pub mod verify;

#[cfg(test)]
mod test_support;
