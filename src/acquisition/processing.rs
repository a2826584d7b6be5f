//! Processing pipeline boundary.
//!
//! The raster extraction pipeline (band cropping, reprojection) lives
//! outside this crate; the scheduler only hands it an unpacked product
//! directory and passes its output path back to the caller unchanged.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

/// External pipeline that consumes an unpacked product.
pub trait ProductProcessor: Send + Sync {
    /// Process the product rooted at `product_dir`, returning the packaged
    /// output location.
    fn process(&self, product_dir: &Path, id: &str) -> Result<PathBuf>;
}

/// Placeholder processor used when no pipeline is wired in.
#[derive(Debug, Default)]
pub struct NoOpProcessor;

impl ProductProcessor for NoOpProcessor {
    fn process(&self, _product_dir: &Path, id: &str) -> Result<PathBuf> {
        bail!("No processing pipeline is configured - cannot process product {id}")
    }
}
