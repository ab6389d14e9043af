//! # Service Launcher
//!
//! > **Lifecycle orchestration for containerized services on edge devices.**
//!
//! The launcher installs, upgrades, removes and supervises services delivered
//! by a cloud controller, on behalf of the device users currently active. It
//! keeps one persistent record per service, binds every service to the user
//! set it was installed for and reclaims services nobody started for longer
//! than their TTL.
//!
//! ## 🏗️ Concurrency Model
//!
//! Every service id has its own worker task that runs lifecycle operations one
//! at a time, in the order they were submitted. Distinct ids run in parallel.
//! Install and remove requests are fire-and-forget: the caller gets one
//! [`StatusEvent`](model::StatusEvent) per accepted request on a shared channel.
//! Bulk operations (user switch, remove all) fan out one request per id on the
//! same workers, join on all of them and reload the runtime once.
//!
//! ## 🗺️ Module Tour
//!
//! ### 1. The Facade ([`launcher`])
//! - **Role**: Public entry point. Owns the active user set and the dispatcher.
//! - **Key items**: [`Launcher`](launcher::Launcher), [`setup_tracing`](launcher::setup_tracing).
//!
//! ### 2. The Engine ([`dispatcher`], [`lifecycle`], [`resolver`], [`sweep`])
//! - **Role**: Per-id serialization, the install/upgrade/remove state machine,
//!   version conflict resolution and the user-binding/TTL sweep.
//!
//! ### 3. The Collaborators ([`registry`], [`bundle`], [`runtime`])
//! - **Role**: Traits at the boundary with storage, bundle download and process
//!   supervision, each with a production implementation.
//! - **Key items**: [`SqliteRegistry`](registry::SqliteRegistry),
//!   [`HttpProvider`](bundle::HttpProvider), [`SystemdRuntime`](runtime::SystemdRuntime).
//!
//! ### 4. Testing ([`mock`])
//! - **Role**: In-process runtime and provider doubles.
//!
//! ## 🚀 Running
//!
//! ```bash
//! RUST_LOG=info cargo run -- config.json user1
//! ```

pub mod bundle;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod launcher;
pub mod lifecycle;
pub mod mock;
pub mod model;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod sweep;
