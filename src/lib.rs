pub mod aggregator;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod database;
pub mod deployment;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod forward;
pub mod functions;
pub mod messaging;
pub mod model_index;
pub mod models;
pub mod node;
pub mod protocol;
pub mod routes;
pub mod task_registry;
pub mod transport;
pub mod worker_pool;
