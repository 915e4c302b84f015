//! Domain services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! `store` and `registry` own the two live maps (boards, sessions). `board`
//! orchestrates them and is the only service routes call for session work.
//! `persistence` and `auth` wrap the external collaborators behind traits.

pub mod auth;
pub mod board;
pub mod persistence;
pub mod registry;
pub mod store;
