//! # Data Model
//!
//! Core data structures for image entity mastering: cluster identifiers,
//! crawl item descriptors, and the raw resource/pixel types exchanged with
//! the analysis collaborators.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Compact identifier for clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(pub u32);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// Page/context metadata attached to one observation of an item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageContext {
    /// Origin page URL where the item was discovered
    pub origin: String,
    /// Alt text, if the page provided one
    pub alt: Option<String>,
    /// Declared width in the page, if any
    pub width: Option<u32>,
    /// Declared height in the page, if any
    pub height: Option<u32>,
    /// Instance number when the same resource appears multiple times on a page.
    /// Zero means "unassigned"; the occurrence provider numbers it.
    pub instance: u32,
}

/// One item observation handed in by the crawling collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDescriptor {
    /// Resource locator (the image URL)
    pub locator: String,
    /// Page metadata for this observation
    pub page: PageContext,
    /// Pre-resolved variant URLs (differently-sized renditions)
    pub variants: Vec<String>,
}

impl ItemDescriptor {
    /// Create a descriptor with no variants.
    pub fn new(locator: impl Into<String>, page: PageContext) -> Self {
        Self {
            locator: locator.into(),
            page,
            variants: Vec::new(),
        }
    }

    /// Add a pre-resolved variant URL.
    pub fn with_variant(mut self, url: impl Into<String>) -> Self {
        self.variants.push(url.into());
        self
    }
}

/// Raw fetched resource, before decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedResource {
    /// The locator this resource was fetched from
    pub locator: String,
    /// Raw payload bytes
    pub bytes: Vec<u8>,
    /// ETag header, if the server sent one
    pub etag: Option<String>,
    /// Last-Modified header, if the server sent one
    pub last_modified: Option<String>,
    /// Content-Length header, if the server sent one
    pub content_length: Option<u64>,
}

impl FetchedResource {
    /// Best cache validator for this resource, in preference order
    /// ETag > Last-Modified > Content-Length. None when the server sent none.
    pub fn validator(&self) -> Option<String> {
        if let Some(etag) = &self.etag {
            return Some(format!("etag:{etag}"));
        }
        if let Some(lm) = &self.last_modified {
            return Some(format!("mod:{lm}"));
        }
        self.content_length.map(|len| format!("len:{len}"))
    }
}

/// Decoded pixel buffer (RGB8, row-major).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    /// `width * height * 3` bytes
    pub pixels: Vec<u8>,
}

impl PixelBuffer {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        debug_assert_eq!(pixels.len(), (width * height * 3) as usize);
        Self {
            width,
            height,
            pixels,
        }
    }
}

/// An RGB color, used in ranked palettes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Opaque external payload owned by exactly one cluster; released when the
/// cluster is retired.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceHandle(pub FetchedResource);
