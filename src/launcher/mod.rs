//! The launcher facade.
//!
//! [`Launcher`] wires the registry, bundle provider and runtime adapter into a
//! [`Lifecycle`](crate::lifecycle::Lifecycle), puts a
//! [`Dispatcher`](crate::dispatcher::Dispatcher) in front of it and owns the active
//! user set. Everything a host process needs goes through it:
//!
//! ```ignore
//! let (launcher, mut status) = Launcher::new(&config, registry, provider, runtime);
//! launcher.set_users(UserSet::new(["user1"])).await?;
//! launcher.install(ServiceInfo::new("svc-a", 5))?;
//! let event = status.recv().await;
//! launcher.close().await;
//! ```

mod facade;
pub mod tracing;

pub use facade::Launcher;
pub use self::tracing::setup_tracing;
