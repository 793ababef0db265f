//! Statically embedded demo page.

use rust_embed::RustEmbed;

/// Files under `web/dist/` compiled into the binary and served as the
/// fallback route.
#[derive(RustEmbed)]
#[folder = "web/dist"]
pub struct Assets;
