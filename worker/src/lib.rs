pub mod backoff;
pub mod config;
pub mod health_monitor;
pub mod ingestion;
pub mod ledger_writer;
pub mod memory_store;
pub mod metrics;
pub mod payment;
pub mod payment_processor;
pub mod processor_type;
pub mod retry_queue;
pub mod selector;
pub mod server;
pub mod service;
pub mod store;
pub mod worker_pool;
