//! Remote-control test interface for a Bluetooth LE GATT stack.
//!
//! An external test driver commands the device to perform GATT client and
//! server operations (service discovery, characteristic and descriptor reads
//! and writes, notification subscription, MTU negotiation) through the
//! synchronous request/response surface in [`gatt`]. The real GATT state
//! machine, radio I/O, and attribute cache live in an externally supplied
//! stack behind the [`gatt::stack`] traits.

pub mod att;
pub mod gap;
#[path = "gatt/gatt.rs"]
pub mod gatt;
pub mod le;

/// Non-async mutex for short critical sections that never hold a guard
/// across a suspension point.
pub(crate) type SyncMutex<T> = parking_lot::Mutex<T>;

/// Returns a string representation of the specified type.
macro_rules! name_of {
    ($t:ty) => {{
        type _T = $t; // Allows $t to be recognized as a type for refactoring
        stringify!($t)
    }};
}
pub(crate) use name_of;

/// Implements `Display` by forwarding to the `Debug` representation.
macro_rules! impl_display_via_debug {
    ($($t:ty),* $(,)?) => {$(
        impl ::core::fmt::Display for $t {
            #[inline(always)]
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                ::core::fmt::Debug::fmt(self, f)
            }
        }
    )*};
}
pub(crate) use impl_display_via_debug;
