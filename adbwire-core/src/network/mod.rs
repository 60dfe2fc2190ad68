pub mod connection;

pub use connection::AdbConnection;
