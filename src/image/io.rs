//! Loading images through the `image` crate.
//!
//! Available when the `image-io` feature is enabled.

use crate::image::{ImageView, OwnedImage};
use crate::util::{DenseMatchError, DenseMatchResult};
use std::path::Path;

/// Creates a borrowed view from a grayscale image buffer.
pub fn view_from_gray_image(img: &image::GrayImage) -> DenseMatchResult<ImageView<'_, u8>> {
    ImageView::from_slice(img.as_raw(), img.width() as usize, img.height() as usize)
}

/// Loads an image from disk and converts it to 8-bit grayscale.
pub fn load_gray_image<P: AsRef<Path>>(path: P) -> DenseMatchResult<OwnedImage> {
    let path = path.as_ref();
    let img = image::open(path).map_err(|err| DenseMatchError::ImageIo {
        reason: format!("{}: {err}", path.display()),
    })?;
    let gray = img.to_luma8();
    OwnedImage::new(gray.as_raw().clone(), gray.width() as usize, gray.height() as usize)
}
