#![forbid(unsafe_code)]

//! Media delivery engine behind the `mediafs` server.
//!
//! The library resolves paths under a trusted media root, streams files with
//! byte-range support, reads HLS playlists, cuts clips out of them and signs
//! short-lived public links. The HTTP binary in `src/bin/mediafs.rs` is a thin
//! layer over [`service::MediaService`].

pub mod cache;
pub mod catalog;
pub mod clip;
pub mod config;
pub mod content_type;
pub mod error;
pub mod files;
pub mod playlist;
pub mod probe;
pub mod range;
pub mod security;
pub mod service;
pub mod signing;
