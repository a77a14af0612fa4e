pub mod memory;
pub mod object;
pub mod opensearch;
pub mod qdrant;
pub mod sqlite;

pub use memory::{InMemoryFacetIndex, InMemoryMetadataStore, InMemoryVectorIndex};
pub use object::{content_hash, FsObjectStore, InMemoryObjectStore};
pub use opensearch::OpenSearchStore;
pub use qdrant::QdrantStore;
pub use sqlite::SqliteMetadataStore;
