//! HTTP surface for zeno.
//!
//! This crate serves the routes a program registers with the `http.*`
//! slots. It handles:
//!
//! - route registration and the hot-swappable route table
//! - request ingestion (query, forms, multipart, JSON bodies)
//! - the per-request pipeline with deadline, arena and middleware
//! - buffered and server-sent-event responses
//! - health, readiness and the admin API
//! - development live reload
//!
//! # Quick Start
//!
//! ```ignore
//! use zeno_common::RuntimeConfig;
//! use zeno_core::Engine;
//! use zeno_server::{AppState, ZenoServer};
//!
//! let config = RuntimeConfig::default();
//! let state = AppState::from_config(Engine::new(), &config.server);
//! state.load_program("app.json".as_ref()).await?;
//!
//! ZenoServer::new(state, config.server, config.admin)
//!     .run(CancellationToken::new())
//!     .await?;
//! ```

pub mod admin;
pub mod handler;
pub mod livereload;
pub mod middleware;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod slots;
pub mod state;

pub use handler::{Pipeline, PipelineSettings};
pub use livereload::LiveReload;
pub use middleware::{BearerAuth, Middleware, MiddlewareRegistry, NativeMiddleware, Rejection};
pub use request::RequestData;
pub use response::ResponseWriter;
pub use router::{HotRouter, RouteCollector, RouteDef, RouteDoc, RouteTable};
pub use server::{TestHandle, ZenoServer, build_router};
pub use state::{AppState, BuildOptions, ReadyStatus};
