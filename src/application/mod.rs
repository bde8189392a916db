pub mod announce;
pub mod applier;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod feed;
pub mod heating;
pub mod jobs;
pub mod repos;
pub mod router;
