pub mod executor;
pub mod forward;
pub mod keys;
pub mod libssh;
pub mod manager;
pub mod registry;
pub mod transport;

pub use executor::{CommandExecutor, CommandOutput};
pub use keys::{KeyKind, PrivateKey};
pub use libssh::Ssh2Transport;
pub use manager::{ConnectionInfo, ConnectionManager, ManagerOptions};
pub use registry::{ChannelId, ChannelLease, ChannelRegistry};
pub use transport::{
    AuthMethod, ExecRequest, HostTarget, RemoteChannel, SessionRef, SshSession, SshTransport,
};
