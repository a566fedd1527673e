pub mod error;
pub mod header;
pub mod block;
pub mod manifest;
pub mod fsutil;
pub mod container;
pub mod codec;
pub mod pool;
pub mod version;
pub mod metadata;
pub mod structure;
pub mod index;
pub mod organizer;
pub mod pipeline;
pub mod products;

pub use error::{Error, Result};
pub use header::ContainerHeader;
pub use container::{Block, BlockBody, Container};
pub use codec::{CodecId, get_codec};
pub use index::{IndexMapping, load_index};
pub use organizer::Descent;
pub use pipeline::{build, extract, BuildOptions, ExtractOptions, RunReport};
pub use version::VersionProfile;
