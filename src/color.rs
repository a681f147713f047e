//! A minimal byte-component color value type.
//!
//! Colors are an out-of-scope subsystem — blend-string parsing, color
//! spaces and premultiplication all live outside this crate — but a
//! concrete value type is needed for the pipeline's inline color field and
//! the blend-enable predicate's alpha check.

/// An RGBA color with byte-valued components, compared and hashed
/// structurally by its four bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub alpha: u8,
}

impl Color {
    pub const WHITE: Color = Color::new(0xff, 0xff, 0xff, 0xff);
    pub const BLACK: Color = Color::new(0x00, 0x00, 0x00, 0xff);

    #[must_use]
    pub const fn new(red: u8, green: u8, blue: u8, alpha: u8) -> Self {
        Self {
            red,
            green,
            blue,
            alpha,
        }
    }

    /// True if this color's alpha channel is fully opaque.
    #[must_use]
    pub const fn is_opaque(&self) -> bool {
        self.alpha == 0xff
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::WHITE
    }
}
