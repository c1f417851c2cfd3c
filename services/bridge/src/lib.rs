pub mod config;
pub mod error;
pub mod proxy;

pub use error::{ChainError, DialFailure, DialStage};
pub use proxy::{
    ChainDialer, ConnectionPool, DialTimeouts, HttpProxy, Listener, ListenerConfig, ListenerMode,
    Peer, PeerChain, PeerTls, SniHijacker, SniInspector, SniResult, Tunnel,
};
