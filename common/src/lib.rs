pub mod db;
pub mod events;
pub mod ids;
pub mod models;
pub mod secrets;
pub mod shutdown;
pub mod ticker;
pub mod verification;
