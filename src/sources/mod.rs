//! Remote catalogue sources.
//!
//! - [`anno`]: the ANNO viewer of the Austrian National Library, scraped from HTML
//! - [`ddb`]: the Deutsche Digitale Bibliothek newspaper portal, queried through its JSON API

pub mod anno;
pub mod ddb;
