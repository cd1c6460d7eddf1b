//! The embedded scripting runtime.
//!
//! Tenants extend the gateway with rhai scripts: route handlers,
//! middleware, and startup registration. The runtime is built from four
//! pieces:
//!
//! - [`pool`] — a bounded pool of pre-initialized interpreters checked
//!   out per request.
//! - [`compiler`] — compiles script files to ASTs and caches them by
//!   logical name until an explicit reload.
//! - [`bridge`] — the `Request`/`Response`/`next` values and the global
//!   `log` function scripts see; nothing else of the host leaks in.
//! - [`registry`] — the `mount`/`route`/`middleware`/`group`/`clear`
//!   surface available to `global-*` scripts during startup.
//!
//! Interpreters never run two requests concurrently; two requests on two
//! interpreters share no state unless a script writes to module tables on
//! purpose.

pub mod bridge;
pub mod compiler;
pub mod pool;
pub mod registry;
