//! Order and credential stores.
//!
//! Persistence seams for the exit-execution pipeline. Orders live in a
//! process-local store (positions are reconstructible from the venue),
//! credentials come from configuration.

pub mod credentials;
pub mod error;
pub mod memory;
pub mod orders;

pub use credentials::{ApiCredentials, CredentialStore, StaticCredentialStore};
pub use error::{Result, StoreError};
pub use memory::MemoryOrderStore;
pub use orders::{ExecutionUpdate, OrderStore};
