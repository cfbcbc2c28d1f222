//! Core trait abstractions.
//!
//! - [`Ledger`] - durable fetch state
//! - [`RawStore`] / [`RecordStore`] - content-addressed bodies and finished records
//! - [`Crawler`] - the crawl capability
//! - [`Reasoner`] - the reasoning capability

pub mod crawler;
pub mod ledger;
pub mod reasoner;
pub mod store;

pub use crawler::{Crawler, UrlValidator, ValidatedCrawler};
pub use ledger::{Ledger, RequeueSelector};
pub use reasoner::{Action, DraftRequest, ExploreRequest, Observation, Reasoner};
pub use store::{RawStore, RecordStore};
