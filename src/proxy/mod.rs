//! Remote-leg establishment and byte relaying.

mod connect;
mod tcp_proxy;

pub use connect::{
    connect_request, dial_through_proxy, handshake, is_tunnel_established, proxy_authority,
    ProxyDialError, RESPONSE_BUFFER_SIZE, TUNNEL_ESTABLISHED,
};
pub use tcp_proxy::{
    connect_remote, handle_relay_session, relay_until_first_close, Direction, RelayError,
    RelayOutcome, RemoteTarget,
};
