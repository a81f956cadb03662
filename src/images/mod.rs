//! Image stages.
//!
//! | Stage | Input | Output | Collaborator |
//! |---|---|---|---|
//! | **Compress** (`tinypng`) | `src/img/**/*.{png,jpg,jpeg}` | same files, overwritten | [`Compressor`] (Tinify API) |
//! | **Copy** (`copy`) | `src/img/**` | `dist/img/**` | filesystem |
//! | **Next-gen** (`webp`) | `dist/img/**/*.{png,jpg,jpeg}` | `<stem>.webp` siblings | [`NextGenEncoder`] (`image` crate) |
//!
//! Compress and next-gen both skip files whose content hash is already
//! recorded in their [`FingerprintManifest`](crate::cache::FingerprintManifest).

pub mod compress;
pub mod copy;
pub mod nextgen;

pub use compress::{CompressError, Compressor, TinifyClient};
pub use nextgen::{NextGenEncoder, NextGenError, WebpEncoder};
