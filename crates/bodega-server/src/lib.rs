mod binary;
mod buffer;
mod conn;
mod pool;
mod reply;
mod server;
mod text;
mod worker;

pub use server::{Server, maximize_sndbuf};

/// Initial read buffer size for fresh connections.
pub(crate) const DATA_BUFFER_SIZE: usize = 2048;
/// Read buffers past this are not recycled, and are shrunk between
/// requests.
pub(crate) const READ_BUFFER_HIGHWAT: usize = 8192;
/// Initial outbound message-list capacity per connection.
pub(crate) const MSG_LIST_INITIAL: usize = 10;
/// Initial pending-item list capacity per connection.
pub(crate) const ITEM_LIST_INITIAL: usize = 200;
/// Suffix freelist retained capacity.
pub(crate) const SUFFIX_LIST_INITIAL: usize = 20;
