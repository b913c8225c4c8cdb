//! Fine stage: local windows around coarse matches and their refinement.
//!
//! For every coarse match a `W x W` window of fine features is cropped in
//! both images, the window pairs go through the fine attention stack, and
//! the centre of window0 is located in window1 by a soft-argmax.

pub mod matching;
pub mod preprocess;

pub use matching::{FineMatcher, FineOffsets};
pub use preprocess::{FinePreprocess, FineWindows};
