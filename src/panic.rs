//! Rendering of panic payloads caught at dispatch boundaries.
//!
//! The reactor and the RPC worker pool both run foreign callbacks under
//! [`std::panic::catch_unwind`]. These helpers turn the opaque payload into
//! something worth logging.

use std::{any::Any, fmt};

/// Borrowed view over a caught panic payload.
///
/// `String` and `&'static str` payloads render as their text; anything else
/// renders as a fixed placeholder because `dyn Any` carries no formatter.
///
/// ```
/// use hostwire::panic::format_panic;
///
/// let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
/// assert_eq!(format_panic(payload.as_ref()).to_string(), "boom");
///
/// let payload: Box<dyn std::any::Any + Send> = Box::new(7_u8);
/// assert_eq!(
///     format_panic(payload.as_ref()).to_string(),
///     "<non-string panic payload>"
/// );
/// ```
#[must_use]
pub struct PanicMessage<'a>(&'a (dyn Any + Send));

impl fmt::Display for PanicMessage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.0.downcast_ref::<String>() {
            f.write_str(s)
        } else if let Some(s) = self.0.downcast_ref::<&'static str>() {
            f.write_str(s)
        } else {
            f.write_str("<non-string panic payload>")
        }
    }
}

impl fmt::Debug for PanicMessage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PanicMessage({self})")
    }
}

/// Wrap a caught panic payload for display.
pub fn format_panic(payload: &(dyn Any + Send)) -> PanicMessage<'_> { PanicMessage(payload) }
