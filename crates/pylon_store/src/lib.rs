//! Script Store: signed, named persistent storage for user scripts.
//!
//! One JSON record per script under the store root, written atomically
//! (temp file + rename). Every record carries an HMAC-SHA256 signature
//! over `name ‖ code`; load recomputes and compares in constant time.
//! Records written before signing was introduced load with a warning and
//! a `legacy` flag instead of failing.
//!
//! Folders are not persisted: the hierarchy is derived from the `folder`
//! fields of the stored scripts.

pub mod store;

pub use store::{ScriptMetadata, ScriptStore, SavedScript, StoreError};
