//! Client for the Dynatrace tenant API
//!
//! Only the deployment endpoints the injection pipeline needs are covered:
//! connection info (tenant UUID and endpoints), the process-module config
//! merged into `ruxitagentproc.conf`, and the code-module archive download.

#![deny(missing_docs)]

pub mod client;
pub mod processmoduleconfig;

pub use client::{
    AgentRequest, ClientOptions, ConnectionInfo, DynatraceClient, DynatraceClientBuilder,
    HttpDynatraceClient, HttpDynatraceClientBuilder,
};
pub use processmoduleconfig::{merge_conf, ProcessModuleConfig, ProcessModuleProperty};
