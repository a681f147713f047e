//! The interface consumed from texture objects.
//!
//! Texture objects themselves — decoding, uploads, mipmap generation — are
//! out of scope. This crate only needs to ask a texture three questions:
//! does it have an alpha channel (feeds the blend-enable predicate), what is
//! its underlying handle (feeds structural comparison, which compares
//! textures by GPU handle rather than wrapper identity), and to prepare it
//! for use immediately before a draw.

/// Flags passed to [`Texture::pre_paint`]; opaque to this crate, forwarded
/// verbatim from the caller.
pub type PrePaintFlags = u32;

/// An opaque, comparable handle to a texture's underlying GPU object.
///
/// Two `Texture` impls that wrap the same underlying GPU resource must
/// return equal handles, since structural pipeline comparison compares
/// textures by handle, not by wrapper identity.
pub type GlHandle = u64;

/// The surface this crate requires of a texture implementation.
pub trait Texture {
    /// Whether sampling this texture can produce a non-opaque alpha value.
    fn has_alpha(&self) -> bool;

    /// The underlying GPU object identity, for structural comparison.
    fn gl_handle(&self) -> GlHandle;

    /// Prepare the texture for sampling (uploads, mipmap generation, etc).
    fn pre_paint(&self, flags: PrePaintFlags);
}
