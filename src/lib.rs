pub mod auth;
pub mod catalog;
pub mod config;
pub mod dedup;
pub mod document;
pub mod domain;
pub mod error;
pub mod fetcher;
pub mod harvest;
pub mod lock;
pub mod oaipmh;
pub mod output;
pub mod producer;
pub mod registration;
pub mod store;
pub mod users;
