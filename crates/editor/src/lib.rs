// peerpad-editor: collaborative editor sync service.

pub mod auth;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod gateway;
pub mod lifecycle;
pub mod persistence;
pub mod registry;
pub mod rooms;
pub mod session;
