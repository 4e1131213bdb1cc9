pub mod chat;
pub mod events;
pub mod image;
pub mod models;
pub mod presets;
pub mod session;
