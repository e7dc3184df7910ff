//! burnguard - per-monitor burn-in protection for Wayland desktops.
//!
//! Watches the display topology, decides per monitor whether anyone is
//! looking at it, and dims or blacks out the ones nobody is. Brightness
//! changes are recorded before they are made, so a crash never leaves a
//! panel dark.

pub mod actuation;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod domain;
pub mod events;
pub mod idle;
pub mod native;
pub mod topology;
pub mod watcher;
