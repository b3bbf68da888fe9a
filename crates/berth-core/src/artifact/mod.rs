//! Artifact coordinates and their resolution against Maven-style repositories.

pub mod coordinate;
pub mod fetch;
pub mod resolver;

pub use coordinate::{
    BinaryCoordinate, CONFIG_PACKAGING, ConfigCoordinate, Coordinate, DEFAULT_PACKAGING,
    ResolvedCoordinate,
};
pub use fetch::Fetcher;
pub use resolver::{RESOURCES_FILE, Repository};
