pub mod bank;
pub mod capital;
pub mod config;
pub mod coordinator;
pub mod dlq;
pub mod domain;
pub mod engine;
pub mod ingestion;
pub mod ledger;
pub mod output_repository;
pub mod peer;
