//! FrontendPage CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the FrontendPage controller.

pub mod frontend_page;

pub use frontend_page::*;
