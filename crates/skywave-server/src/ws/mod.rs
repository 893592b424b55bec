pub mod audio;
pub mod chat;
pub mod events;
pub mod waterfall;
