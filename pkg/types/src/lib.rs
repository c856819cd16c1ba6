//! Data model shared by the rbacfleet API server and controllers.

pub mod cluster;
pub mod config;
pub mod event;
pub mod kubeconfig;
pub mod rbac;
pub mod remote;
pub mod secret;
pub mod selector;
pub mod validate;
