//! Transport factory surface consumed by upper layers

use crate::client::Client;
use crate::transport::Transport;
use crate::ClientResult;
use async_trait::async_trait;
use relaymux_proto::PublicKey;
use std::fmt::Debug;

/// Creates point-to-point transports between node identities
///
/// Upper layers program against this trait so the relay transport can sit
/// next to other transport kinds.
#[async_trait]
pub trait TransportFactory: Send + Sync + Debug {
    type Transport: Send;

    /// Open a transport to `remote`
    async fn dial(&self, remote: PublicKey) -> ClientResult<Self::Transport>;

    /// Wait for a transport opened by a remote node
    async fn accept(&self) -> ClientResult<Self::Transport>;

    /// Identity of this node
    fn local(&self) -> PublicKey;

    /// Short name of the transport kind
    fn type_name(&self) -> &str;

    /// Stop producing transports and release resources
    async fn close(&self);
}

#[async_trait]
impl TransportFactory for Client {
    type Transport = Transport;

    async fn dial(&self, remote: PublicKey) -> ClientResult<Transport> {
        Client::dial(self, remote).await
    }

    async fn accept(&self) -> ClientResult<Transport> {
        Client::accept(self).await
    }

    fn local(&self) -> PublicKey {
        Client::local(self)
    }

    fn type_name(&self) -> &str {
        Client::type_name(self)
    }

    async fn close(&self) {
        Client::close(self).await
    }
}
