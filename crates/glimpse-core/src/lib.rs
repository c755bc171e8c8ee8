pub mod errors;
pub mod events;
pub mod ids;
pub mod time;
pub mod truncate;
