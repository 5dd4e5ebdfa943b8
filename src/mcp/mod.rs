//! Model Context Protocol (MCP) endpoint plumbing.
//!
//! Endpoints are either spawned processes speaking newline-delimited
//! JSON-RPC over stdio, or remote servers reached through an SSE stream
//! plus HTTP POST. Each endpoint gets a [`manager::ConnectionManager`] that
//! reconnects in the background; the [`registry::EndpointRegistry`] maps
//! names to managers and the [`dispatcher::Dispatcher`] exposes them all to
//! the model as one generic `mcp_query` tool.
//!
//! # Configuration
//!
//! Endpoints are configured in a JSON file, either as a list:
//!
//! ```json
//! [
//!   { "name": "time", "type": "stdio", "command": "npx", "args": ["-y", "@mcpcentral/mcp-time"] },
//!   { "name": "maps", "type": "sse", "baseUrl": "https://mcp.example.com/sse",
//!     "headers": { "Authorization": "Bearer ${MAPS_TOKEN}" } }
//! ]
//! ```
//!
//! or in the common `mcpServers` map form. `${NAME}` placeholders are
//! expanded from the environment.

pub mod config;
pub mod dispatcher;
pub mod manager;
pub mod registry;
pub(crate) mod rpc;
pub mod sse;
pub mod stdio;
pub mod transport;
pub mod types;

pub use config::{EndpointConfig, EndpointKind};
pub use dispatcher::{DISPATCH_TOOL_NAME, DispatchRequest, Dispatcher};
pub use manager::{ConnectionManager, ConnectionState, ManagerSettings, ReconnectPolicy};
pub use registry::EndpointRegistry;
pub use transport::{CallContext, Connector, EndpointConnector, NotificationHandler, Transport};
