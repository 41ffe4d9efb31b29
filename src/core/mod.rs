pub mod error;
pub mod imap;
pub mod keyring;
pub mod mime;
pub mod models;
pub mod network;
pub mod notify;
pub mod transport;
pub mod viewer;
