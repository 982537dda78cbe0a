//! Callback-style completion for any operation.
//!
//! Every operation in this crate is an `async fn`. [`Completion`] lets a
//! caller hand the result to a callback instead of awaiting it:
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use ramux::storage::{MemoryStorage, RandomAccess};
//! use ramux::Completion;
//!
//! let storage = std::sync::Arc::new(MemoryStorage::from_bytes(b"hi".to_vec()));
//! let (tx, rx) = tokio::sync::oneshot::channel();
//!
//! let file = storage.clone();
//! async move { file.read(0, 2).await }.on_complete(move |result| {
//!     let _ = tx.send(result.map(|b| b.to_vec()));
//! });
//!
//! assert_eq!(rx.await.unwrap().unwrap(), b"hi");
//! # }
//! ```

use std::future::Future;

use tokio::task::JoinHandle;

/// Run a future in the background and pass its output to a callback.
pub trait Completion: Future + Sized {
    /// Spawn `self` and call `callback` with its output.
    ///
    /// Must be called from within a tokio runtime.
    fn on_complete<F>(self, callback: F) -> JoinHandle<()>
    where
        Self: Send + 'static,
        Self::Output: Send + 'static,
        F: FnOnce(Self::Output) + Send + 'static,
    {
        tokio::spawn(async move { callback(self.await) })
    }
}

impl<T: Future> Completion for T {}
