pub mod connection;
pub mod libssh;
pub mod params;
pub mod pool;
pub mod transport;

pub use connection::{Connection, ConnectionManager};
pub use libssh::Ssh2Transport;
pub use params::{ConnectionKey, ConnectionParams, Credential};
pub use pool::{ConnectionPool, SharedConnection};
pub use transport::{
    FileTransfer, OutputChunk, OutputStream, RemoteChannel, RemoteSession, Transport,
};
