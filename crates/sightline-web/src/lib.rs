#![forbid(unsafe_code)]

//! Browser host for sightline.
//!
//! # Role in sightline
//! `sightline-web` implements the `sightline-core` host traits over
//! `IntersectionObserver`, and exports a `VisibilityWatcher` class to
//! JavaScript via `wasm-bindgen`.
//!
//! # Primary responsibilities
//! - **ObserverInit**: maps a context key to observer options and rejects
//!   values the browser would throw on. Plain Rust, tested natively.
//! - **WebHost / WebContext**: one observer per context key, one shared
//!   delivery closure per host (wasm32 only).
//! - **DomNode**: element handle compared by node identity (wasm32 only).

pub mod observer_init;

pub use observer_init::ObserverInit;

#[cfg(target_arch = "wasm32")]
mod wasm;

#[cfg(target_arch = "wasm32")]
pub use wasm::{DomNode, VisibilityWatcher, WebContext, WebHost, web_registry};
