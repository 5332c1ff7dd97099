//! plugrig-sdk: SDK for writing Wasm plugin units
//!
//! A unit is one `.wasm` module that may define several plugins. The SDK
//! provides the memory helpers and export glue the host expects.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use plugrig_sdk::prelude::*;
//!
//! struct Greeter;
//!
//! impl PluginUnit for Greeter {
//!     fn manifest() -> UnitManifest {
//!         UnitManifest::new()
//!             .plugin(PluginSpec::new("greet").version("1.0.0").command("hello"))
//!     }
//!
//!     fn call(request: GuestRequest) -> GuestResponse {
//!         match request {
//!             GuestRequest::HandleCommand { command, args, .. } if command == "hello" => {
//!                 GuestResponse::text(format!("Hello, {}!", args))
//!             }
//!             GuestRequest::HandleCommand { .. } => GuestResponse::Text(None),
//!             _ => GuestResponse::Done,
//!         }
//!     }
//! }
//!
//! // Generate all required exports
//! export_unit!(Greeter);
//! ```

use std::alloc::{alloc, dealloc, Layout};

// Re-export everything from plugrig-api
pub use plugrig_api::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{export_unit, memory, PluginUnit};
    pub use plugrig_api::{
        Capabilities, GuestRequest, GuestResponse, PluginSpec, UnitManifest, API_VERSION,
    };
}

/// Trait that Wasm plugin units implement
pub trait PluginUnit {
    /// Returns the manifest listing every plugin in this unit
    fn manifest() -> UnitManifest;

    /// Handles one host request addressed to one of this unit's plugins
    fn call(request: GuestRequest) -> GuestResponse;
}

/// Memory utilities for Wasm plugin development
pub mod memory {
    use super::*;

    /// Allocate memory in the Wasm linear memory
    #[inline]
    pub fn plugin_alloc(size: i32) -> i32 {
        if size <= 0 {
            return 0;
        }
        match Layout::from_size_align(size as usize, 1) {
            Ok(layout) => unsafe { alloc(layout) as i32 },
            Err(_) => 0,
        }
    }

    /// Deallocate memory in the Wasm linear memory
    ///
    /// The ptr must have been allocated by `plugin_alloc` with the same size.
    #[inline]
    pub fn plugin_dealloc(ptr: i32, size: i32) {
        if ptr == 0 || size <= 0 {
            return;
        }
        if let Ok(layout) = Layout::from_size_align(size as usize, 1) {
            unsafe { dealloc(ptr as *mut u8, layout) }
        }
    }

    /// Pack a pointer and length into a single i64 value
    ///
    /// wasm32-unknown-unknown has no multi-value returns, so both halves
    /// travel in one i64: `(ptr << 32) | len`.
    #[inline]
    pub fn pack_ptr_len(ptr: i32, len: i32) -> i64 {
        ((ptr as i64) << 32) | (len as i64 & 0xFFFFFFFF)
    }

    /// Serialize data and return it as an allocated buffer
    ///
    /// Returns a packed i64 containing the pointer and length.
    pub fn serialize_and_return<T: serde::Serialize>(data: &T) -> i64 {
        let bytes = plugrig_api::encode(data).unwrap_or_default();
        let len = bytes.len() as i32;
        let ptr = plugin_alloc(len);

        if ptr != 0 && len > 0 {
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, len as usize);
            }
        }

        pack_ptr_len(ptr, len)
    }

    /// Deserialize data from a raw pointer and length
    ///
    /// # Safety
    /// The pointer must be valid and point to `len` bytes of valid MessagePack data.
    pub unsafe fn deserialize_from_ptr<T: serde::de::DeserializeOwned>(
        ptr: i32,
        len: i32,
    ) -> Option<T> {
        if ptr == 0 || len <= 0 {
            return None;
        }
        let slice = std::slice::from_raw_parts(ptr as *const u8, len as usize);
        plugrig_api::decode(slice).ok()
    }
}

/// Macro to export all required unit functions
///
/// Generates `plugin_manifest`, `plugin_call`, `plugin_alloc` and
/// `plugin_dealloc`. A request that cannot be decoded is answered with
/// `GuestResponse::Error`.
#[macro_export]
macro_rules! export_unit {
    ($unit:ty) => {
        #[no_mangle]
        pub extern "C" fn plugin_manifest() -> i64 {
            let manifest = <$unit as $crate::PluginUnit>::manifest();
            $crate::memory::serialize_and_return(&manifest)
        }

        #[no_mangle]
        pub extern "C" fn plugin_call(req_ptr: i32, req_len: i32) -> i64 {
            let request: Option<$crate::GuestRequest> =
                unsafe { $crate::memory::deserialize_from_ptr(req_ptr, req_len) };
            let response = match request {
                Some(request) => <$unit as $crate::PluginUnit>::call(request),
                None => $crate::GuestResponse::error("malformed request"),
            };
            $crate::memory::serialize_and_return(&response)
        }

        #[no_mangle]
        pub extern "C" fn plugin_alloc(size: i32) -> i32 {
            $crate::memory::plugin_alloc(size)
        }

        #[no_mangle]
        pub extern "C" fn plugin_dealloc(ptr: i32, size: i32) {
            $crate::memory::plugin_dealloc(ptr, size)
        }
    };
}
