//! Native plugin ABI
//!
//! A native plugin is a `cdylib` exporting one static named
//! `bulwark_plugin_declaration`. The host checks the declared API version and
//! then calls `register`, which hands every exported plugin type name and its
//! factory to the host's registrar.
//!
//! Host and plugin must be built with the same toolchain and the same
//! `bulwark-sdk` API version, since trait objects cross the boundary.
//!
//! # Examples
//!
//! ```ignore
//! use bulwark_sdk::abi::default_factory;
//!
//! bulwark_sdk::export_plugins! {
//!     "DpsMeter" => default_factory::<DpsMeter>,
//! }
//! ```

use crate::errors::PluginError;
use crate::plugin::Plugin;

/// Version of the native plugin ABI. Bumped on any incompatible change.
pub const PLUGIN_API_VERSION: u32 = 1;

/// Version of the SDK the plugin was compiled against
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Symbol name of the exported declaration (nul-terminated for symbol lookup)
pub const DECLARATION_SYMBOL: &[u8] = b"bulwark_plugin_declaration\0";

/// Constructor for one exported plugin type
pub type PluginFactory = fn() -> Result<Box<dyn Plugin>, PluginError>;

/// Receives exported plugin types during registration
pub trait PluginRegistrar {
    fn register(&mut self, type_name: &str, factory: PluginFactory);
}

/// Static declaration exported by every native plugin
#[derive(Copy, Clone)]
pub struct PluginDeclaration {
    pub api_version: u32,
    pub sdk_version: &'static str,
    pub register: fn(&mut dyn PluginRegistrar),
}

/// Factory that builds a plugin through its `Default` implementation
pub fn default_factory<T>() -> Result<Box<dyn Plugin>, PluginError>
where
    T: Plugin + Default + 'static,
{
    Ok(Box::new(T::default()))
}

/// Export the plugin declaration for a native plugin library
#[macro_export]
macro_rules! export_plugins {
    ($($type_name:literal => $factory:expr),+ $(,)?) => {
        #[doc(hidden)]
        #[no_mangle]
        #[allow(non_upper_case_globals)]
        pub static bulwark_plugin_declaration: $crate::abi::PluginDeclaration =
            $crate::abi::PluginDeclaration {
                api_version: $crate::abi::PLUGIN_API_VERSION,
                sdk_version: $crate::abi::SDK_VERSION,
                register: {
                    fn __bulwark_register(registrar: &mut dyn $crate::abi::PluginRegistrar) {
                        $( registrar.register($type_name, $factory); )+
                    }
                    __bulwark_register
                },
            };
    };
}
