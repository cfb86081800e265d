//! Discovery of new granules and PDRs on a provider
//!
//! Both discoverers take one flat listing from a [`ProviderClient`] (the
//! hierarchical clients walk their path specification through
//! [`crate::lister`]) and turn it into work for the transfer engine.

pub mod granules;
pub mod pdr_parser;
pub mod pdrs;

pub use granules::{
    classify_files, discover_granules, group_files, handle_duplicate_granules, DiscoverOptions,
    GranuleRegistry,
};
pub use pdr_parser::{parse_pdr, ParsedPdr};
pub use pdrs::{discover_pdrs, is_pdr, pdr_key, stage_pdr, PdrDiscovery, StagedPdr};
