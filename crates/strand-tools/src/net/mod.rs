//! Reactor-integrated networking

mod tcp;

pub use tcp::{TcpListener, TcpStream};
