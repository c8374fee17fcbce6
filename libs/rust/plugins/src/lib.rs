//! Optional components for biscus, published through a [`PluginCatalog`].
//!
//! Nothing here is registered by default. A deployment opts in by listing
//! the modules in its plugin declaration file:
//!
//! ```yaml
//! strategydecorator:
//!   - path: ./plugins
//!     modules: [basicstrategydecorator]
//! model:
//!   - path: ./plugins
//!     modules: [noop]
//! ```

pub mod decorators;
pub mod noop;

use biscus_core::PluginCatalog;

/// Module names this package answers to.
pub const MODULES: [&str; 2] = ["basicstrategydecorator", "noop"];

/// Makes this package's modules importable by the plugin manager.
pub fn install(catalog: &mut PluginCatalog) {
    catalog.provide("basicstrategydecorator", decorators::modules_and_configs).provide("noop", noop::modules_and_configs);
}
