pub mod connectivity;
pub mod db;
pub mod error;
pub mod models;
pub mod queue;
pub mod remote;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;
