//! MCP protocol layer for the Cadence orchestration engine.
//!
//! Bridges the typed core command surface to MCP clients:
//!
//! - [`handler`] implements the `ProtocolHandler` trait over the core
//!   services (executor, batch coordinator, graph service, store)
//! - [`rmcp_handler`] exposes the commands as MCP tools via the RMCP SDK
//! - [`serialization`] builds the shared response envelope
//! - [`error`] parses string-typed wire parameters into core types
//!
//! # Usage
//!
//! ```rust,no_run
//! use flow_core::{flow::FlowConfig, lock::LockManager};
//! use mcp_protocol::{CadenceRouter, OrchestratorHandler};
//! use mocks::InMemoryEntityStore;
//! use std::sync::Arc;
//!
//! let store = Arc::new(InMemoryEntityStore::new());
//! let locks = Arc::new(LockManager::new());
//! let config = Arc::new(FlowConfig::default());
//! let handler = Arc::new(OrchestratorHandler::new(store, locks, config));
//! let router = CadenceRouter::new(handler);
//! // router.serve(rmcp::transport::stdio()) from the server binary
//! # let _ = router;
//! ```

pub mod error;
pub mod handler;
pub mod rmcp_handler;
pub mod serialization;

pub use handler::OrchestratorHandler;
pub use rmcp_handler::CadenceRouter;
pub use serialization::{render, render_error, success_response};

// Re-export the command/response types consumers wire against.
pub use flow_core::protocol::{
    GetNextStatusParams, ManageContainerParams, ManageDependenciesParams, ProtocolHandler,
    QueryContainerParams, QueryDependenciesParams, QueryRoleTransitionsParams,
    RequestTransitionParams, ToolResponse,
};
