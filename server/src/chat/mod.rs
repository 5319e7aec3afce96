pub mod directory;
pub mod error;
pub mod messages;
pub mod models;
pub mod presence;
pub mod roster;
pub mod sessions;
pub mod typing;
