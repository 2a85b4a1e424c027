pub mod aggregate;
pub mod backfill;
pub mod db;
pub mod debounce;
pub mod error;
pub mod form;
pub mod models;
pub mod provider;
pub mod reading_import;
pub mod service;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_support;
