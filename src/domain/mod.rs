pub mod entities;
pub mod error;
pub mod events;
pub mod types;
