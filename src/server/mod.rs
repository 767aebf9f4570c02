//! Authoritative server: game workers, routing and the lobby.

pub mod game;
pub mod lobby;
pub mod router;
