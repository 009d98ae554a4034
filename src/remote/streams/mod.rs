pub mod listen;
pub mod write;

pub use listen::{ListenKind, ListenStream, ListenStreamListener};
pub use write::{WriteKind, WriteStream, WriteStreamListener};
