pub mod app;
pub mod bootstrap;
pub mod cmd;
pub mod config;
pub mod domain;
pub mod fact_source;
pub mod k8s;
pub mod labeler;
pub mod labels;
pub mod metrics;
pub mod supervisor;
