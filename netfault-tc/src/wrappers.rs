use std::{ffi::CString, num::NonZeroU32};

/// Resolve an interface name to its index, in the network namespace of the calling thread.
///
/// Returns `None` if the name is not a valid C string or no such interface exists.
pub fn if_nametoindex(name: &str) -> Option<NonZeroU32> {
    let string = CString::new(name).ok()?;
    // SAFETY: `string` is a valid NUL terminated string that outlives the call.
    let index = unsafe { nix::libc::if_nametoindex(string.as_ptr()) };
    NonZeroU32::new(index)
}
