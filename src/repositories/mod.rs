//! # Repository Layer
//!
//! Repositories over the engine's tracking tables. Each borrows a connection
//! or transaction, so callers decide the transactional boundary.

pub mod asset_map;
pub mod person_map;
pub mod record_failure;
pub mod skip_list;

pub use asset_map::AssetMapRepository;
pub use person_map::PersonMapRepository;
pub use record_failure::FailureRepository;
pub use skip_list::SkipListRepository;
