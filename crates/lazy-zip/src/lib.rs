//! Lazy remote ZIP entry fetcher.
//!
//! Read individual named entries out of a large remote archive without
//! downloading the whole file. The reader bootstraps from HTTP byte-range
//! requests against the archive trailer, caches every fetched byte range in
//! a shared persistent fragment store, load-balances entry requests across
//! a pool of parallel fetch lanes, and transparently degrades to a single
//! full in-memory download when the server does not answer with
//! `206 Partial Content`.
//!
//! Structure
//! ---------
//! - [`LazyZip`]: the client-facing pool (connect, entry list, per-entry
//!   buffers, abort, prefetch).
//! - `lane` / `handle`: isolated worker tasks behind message channels, one
//!   bootstrap and one pending-request table each.
//! - [`FragmentCache`]: sqlite-backed byte-range store shared across
//!   documents, with count/age-bounded eviction.
//! - [`RangeDownloader`]: stateless range/full HTTP fetches.
//! - The ZIP codec itself lives in the sibling `lazy-zip-format` crate.
//!
//! Example
//! -------
//! ```no_run
//! use lazy_zip::{LazyZip, Settings};
//!
//! # async fn demo() -> lazy_zip::FetchResult<()> {
//! let zip = LazyZip::connect("https://example.com/photos.zip", Settings::new()).await?;
//! for name in zip.entry_names() {
//!     println!("{name}");
//! }
//! let buffer = zip.get_buffer("cover.jpg").await?;
//! # let _ = buffer;
//! # Ok(())
//! # }
//! ```

mod bootstrap;
mod error;
mod handle;
mod lane;
mod pool;
mod resolver;
mod settings;

pub mod cache;
pub mod downloader;

pub use cache::FragmentCache;
pub use downloader::{RangeDownloader, RangeSpec};
pub use error::{FetchError, FetchResult};
pub use pool::LazyZip;
pub use settings::Settings;

pub use lazy_zip_format::{ByteRange, FormatError, ZipIndex};
