//! # kash-store
//!
//! Persistence backends for the Kamer Kash billing flow.
//!
//! ## Backends
//!
//! - **Supabase** (default): the hosted Postgres database through its
//!   PostgREST interface, authenticated with the service-role key
//! - **Memory**: [`MemoryStore`] from `kash-core`, for development and tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kash_store::{SupabaseConfig, SupabaseStore};
//!
//! let store: Arc<dyn BillingStore> = match SupabaseConfig::from_env() {
//!     Some(config) => Arc::new(SupabaseStore::new(&config)?),
//!     None => Arc::new(MemoryStore::seeded(clock)),
//! };
//! ```

#[cfg(feature = "supabase")]
pub mod supabase;

#[cfg(feature = "supabase")]
pub use supabase::{SupabaseConfig, SupabaseStore};

// Re-export core types for convenience
pub use kash_core::{BillingStore, MemoryStore, Result, StoreError};
