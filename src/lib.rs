//! Sandmark provides the marking side of a tracing garbage collector for a JavaScript-style
//! heap, and the sandboxed tables through which heap objects refer to memory outside the heap.
//!
//! * [`heap`]: the marking visitors. [`heap::FullMarkingVisitor`] marks the whole heap and
//!   defers weak references, ephemerons and flushable code. [`heap::YoungGenerationMarkingVisitor`]
//!   marks the young generation only and treats everything it reaches as strong.
//! * [`sandbox`]: [`sandbox::ExternalEntityTable`], a segmented table of fixed-size entries
//!   with a lock-free freelist, and [`sandbox::ExternalPointerTable`] built on top of it.
//! * [`vm`]: the [`vm::ObjectModel`] through which the visitors inspect objects, and the
//!   field layouts of the object kinds that are visited specially.
//!
//! Logging goes through the `log` crate. Call [`util::logger::try_init`] to install the
//! built-in `env_logger`, and use the `SANDMARK_LOG` environment variable to filter it.

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

pub mod heap;
pub mod sandbox;
pub mod util;
pub mod vm;

pub use crate::util::options::Options;
